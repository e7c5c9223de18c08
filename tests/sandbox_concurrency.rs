//! Sandbox Concurrency Integration Tests
//!
//! Admission control under the concurrency ceiling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stepwise::core::{SandboxLimits, SandboxScript, ScriptSandbox};
use stepwise::domain::exit_code;
use stepwise::domain::Variables;

/// Busy-waits for `seconds` inside the script
fn sleeper(seconds: f64) -> SandboxScript {
    SandboxScript::new(
        format!("let started = timestamp(); while started.elapsed < {seconds:.1} {{ }} #{{ code: 0 }}"),
        Variables::new(),
    )
}

fn sandbox(max_concurrent: usize, admission_timeout_ms: u64) -> Arc<ScriptSandbox> {
    Arc::new(ScriptSandbox::new(SandboxLimits {
        max_concurrent,
        admission_timeout_ms,
        ..SandboxLimits::default()
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_third_caller_times_out_at_admission() {
    let sandbox = sandbox(2, 300);

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.evaluate(sleeper(1.0)).await })
        })
        .collect();

    let mut codes = Vec::new();
    for call in calls {
        codes.push(call.await.unwrap().code);
    }
    codes.sort();

    assert_eq!(
        codes,
        vec![exit_code::SANDBOX_ADMISSION_TIMEOUT, exit_code::SUCCESS, exit_code::SUCCESS]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_third_caller_waits_for_a_slot() {
    let sandbox = sandbox(2, 5_000);
    let started = Instant::now();

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let sandbox = Arc::clone(&sandbox);
            tokio::spawn(async move { sandbox.evaluate(sleeper(0.5)).await })
        })
        .collect();

    for call in calls {
        let result = call.await.unwrap();
        assert!(result.success, "unexpected failure: {:?}", result.error);
    }

    // Two rounds of 0.5s each.
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(sandbox.available_slots(), 2);
}
