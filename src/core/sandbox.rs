//! Sandboxed script evaluation.
//!
//! Every call gets a fresh `rhai` engine on a blocking worker. Admission is
//! bounded by a semaphore (how many scripts may run at once) and each run is
//! bounded by a wall-clock timeout. Nothing here returns an error to the
//! caller: every failure is folded into a `SandboxResult` with a stable
//! negative code.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, Map, Scope};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::recipe::{exit_code, EXEC_ERROR, EXEC_EXIT_CODE};
use crate::domain::{ExecuteRecipe, Variables};

/// Limits applied to every evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Scripts allowed to run at the same time (default: 6)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long to wait for a free slot (default: 6s)
    #[serde(default = "default_admission_timeout")]
    pub admission_timeout_ms: u64,

    /// Ceiling used when a script asks for no timeout (default: 30 min)
    #[serde(default = "default_timeout")]
    pub default_timeout_seconds: u64,
}

fn default_max_concurrent() -> usize {
    6
}
fn default_admission_timeout() -> u64 {
    6_000
}
fn default_timeout() -> u64 {
    30 * 60
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            admission_timeout_ms: default_admission_timeout(),
            default_timeout_seconds: default_timeout(),
        }
    }
}

impl SandboxLimits {
    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Effective timeout; zero or negative falls back to the long ceiling
    pub fn timeout_for(&self, requested_seconds: i64) -> Duration {
        if requested_seconds <= 0 {
            Duration::from_secs(self.default_timeout_seconds)
        } else {
            Duration::from_secs(requested_seconds as u64)
        }
    }
}

/// A script to evaluate
#[derive(Debug, Clone, Default)]
pub struct SandboxScript {
    /// Script fragment; must evaluate to `#{ code, error, value }`
    pub code: String,

    /// Bound as the `env` object map
    pub variables: Variables,

    /// Seconds; `<= 0` means the default ceiling
    pub timeout_seconds: i64,
}

impl SandboxScript {
    pub fn new(code: impl Into<String>, variables: Variables) -> Self {
        Self {
            code: code.into(),
            variables,
            timeout_seconds: 0,
        }
    }

    pub fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Ways an evaluation can fail
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxFailure {
    #[error("Sandbox initialization failed: {0}")]
    Init(String),

    #[error("No sandbox slot available within {0:?}")]
    AdmissionTimeout(Duration),

    #[error("Script timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Script returned a malformed result: {0}")]
    MalformedResult(String),

    #[error("Script raised an exception: {0}")]
    Exception(String),

    #[error("{message}")]
    ScriptError { code: i64, message: String },
}

impl SandboxFailure {
    /// Stable negative code for this failure
    pub fn code(&self) -> i64 {
        match self {
            Self::Init(_) => exit_code::SANDBOX_INIT,
            Self::AdmissionTimeout(_) => exit_code::SANDBOX_ADMISSION_TIMEOUT,
            Self::ExecutionTimeout(_) => exit_code::SANDBOX_EXECUTION_TIMEOUT,
            Self::MalformedResult(_) => exit_code::SANDBOX_MALFORMED_RESULT,
            Self::Exception(_) => exit_code::SANDBOX_EXCEPTION,
            Self::ScriptError { code, .. } => *code,
        }
    }
}

/// Structured outcome of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    pub success: bool,

    pub code: i64,

    pub error: Option<String>,

    /// Output variables (plus `ExecExitCode`/`ExecError` on failure)
    pub variables: Variables,

    /// Text printed by the script
    pub output: String,
}

impl SandboxResult {
    fn succeeded(code: i64, variables: Variables, output: String) -> Self {
        Self {
            success: true,
            code,
            error: None,
            variables,
            output,
        }
    }

    fn failed(failure: SandboxFailure, mut variables: Variables, output: String) -> Self {
        let code = failure.code();
        let message = failure.to_string();
        variables.insert(EXEC_EXIT_CODE.to_string(), code.to_string());
        variables.insert(EXEC_ERROR.to_string(), message.clone());
        Self {
            success: false,
            code,
            error: Some(message),
            variables,
            output,
        }
    }
}

impl From<SandboxResult> for ExecuteRecipe {
    fn from(result: SandboxResult) -> Self {
        Self {
            code: result.code,
            output: result.output,
            vars: result.variables,
            error: result.error,
        }
    }
}

/// Admission-controlled evaluator for untrusted scripts
pub struct ScriptSandbox {
    limits: SandboxLimits,
    permits: Arc<Semaphore>,
}

impl Default for ScriptSandbox {
    fn default() -> Self {
        Self::new(SandboxLimits::default())
    }
}

impl ScriptSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrent.max(1)));
        Self { limits, permits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Free evaluation slots right now
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Evaluate a script under the concurrency ceiling and its timeout
    pub async fn evaluate(&self, script: SandboxScript) -> SandboxResult {
        let admission = self.limits.admission_timeout();
        let _permit = match timeout(admission, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return SandboxResult::failed(
                    SandboxFailure::Init("sandbox is shut down".to_string()),
                    Variables::new(),
                    String::new(),
                );
            }
            Err(_) => {
                warn!(wait_ms = admission.as_millis() as u64, "Sandbox admission timed out");
                return SandboxResult::failed(
                    SandboxFailure::AdmissionTimeout(admission),
                    Variables::new(),
                    String::new(),
                );
            }
        };

        let limit = self.limits.timeout_for(script.timeout_seconds);
        let abort = Arc::new(AtomicBool::new(false));
        let worker_abort = Arc::clone(&abort);
        let SandboxScript {
            code, variables, ..
        } = script;

        debug!(timeout_ms = limit.as_millis() as u64, "Evaluating script");
        let worker =
            tokio::task::spawn_blocking(move || run_isolated(&code, &variables, worker_abort));

        match timeout(limit, worker).await {
            Ok(Ok(report)) => report.into_result(),
            Ok(Err(e)) => SandboxResult::failed(
                SandboxFailure::Exception(format!("worker did not complete: {e}")),
                Variables::new(),
                String::new(),
            ),
            Err(_) => {
                // The engine polls this flag between operations and stops itself.
                abort.store(true, Ordering::Relaxed);
                warn!(timeout_ms = limit.as_millis() as u64, "Script timed out");
                SandboxResult::failed(
                    SandboxFailure::ExecutionTimeout(limit),
                    Variables::new(),
                    String::new(),
                )
            }
        }
    }
}

/// What the worker hands back
struct WorkerReport {
    output: String,
    outcome: Result<Normalized, SandboxFailure>,
}

impl WorkerReport {
    fn into_result(self) -> SandboxResult {
        match self.outcome {
            Ok(Normalized {
                code,
                error: None,
                vars,
            }) => SandboxResult::succeeded(code, vars, self.output),
            Ok(Normalized {
                code,
                error: Some(message),
                vars,
            }) => {
                let code = if code < 0 {
                    code
                } else {
                    exit_code::SANDBOX_SCRIPT_ERROR
                };
                SandboxResult::failed(SandboxFailure::ScriptError { code, message }, vars, self.output)
            }
            Err(failure) => SandboxResult::failed(failure, Variables::new(), self.output),
        }
    }
}

/// Script result after normalization
#[derive(Debug)]
struct Normalized {
    code: i64,
    error: Option<String>,
    vars: Variables,
}

/// Runs on the blocking worker with an engine nobody else sees
fn run_isolated(code: &str, variables: &Variables, abort: Arc<AtomicBool>) -> WorkerReport {
    let output = Arc::new(Mutex::new(String::new()));

    let mut engine = Engine::new();
    {
        let output = Arc::clone(&output);
        engine.on_print(move |line| append_line(&output, line));
    }
    {
        let output = Arc::clone(&output);
        engine.on_debug(move |line, _source, _pos| append_line(&output, line));
    }
    engine.on_progress(move |_ops| {
        if abort.load(Ordering::Relaxed) {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    let outcome = inject_environment(&engine, variables).and_then(|env| {
        let mut scope = Scope::new();
        scope.push("env", env);
        // Compiled at global level so scripts may define helper functions.
        let ast = engine
            .compile(code)
            .map_err(|e| SandboxFailure::Exception(format!("Syntax error: {e}")))?;
        engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(classify_error)
            .and_then(normalize)
    });

    let output = match output.lock() {
        Ok(buffer) => buffer.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    WorkerReport { output, outcome }
}

fn append_line(buffer: &Mutex<String>, line: &str) {
    let mut buffer = match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    buffer.push_str(line);
    buffer.push('\n');
}

/// Serialize the caller's variables and bind them as an object map
fn inject_environment(engine: &Engine, variables: &Variables) -> Result<Map, SandboxFailure> {
    let json = serde_json::to_string(variables)
        .map_err(|e| SandboxFailure::Init(format!("cannot serialize environment: {e}")))?;
    engine
        .parse_json(&json, true)
        .map_err(|e| SandboxFailure::Init(format!("cannot bind environment: {e}")))
}

fn classify_error(error: Box<EvalAltResult>) -> SandboxFailure {
    if matches!(*error, EvalAltResult::ErrorTerminated(..)) {
        SandboxFailure::Exception("script was stopped after its timeout".to_string())
    } else {
        SandboxFailure::Exception(error.to_string())
    }
}

/// Coerce the script's value into `{code, error, value}`
fn normalize(value: Dynamic) -> Result<Normalized, SandboxFailure> {
    let type_name = value.type_name();
    let Some(map) = value.try_cast::<Map>() else {
        return Err(SandboxFailure::MalformedResult(format!(
            "expected an object map, got {type_name}"
        )));
    };

    let code = read_code(map.get("code"))?;

    let error = map
        .get("error")
        .filter(|v| !v.is_unit())
        .map(stringify)
        .filter(|message| !message.is_empty());

    let vars = match map.get("value") {
        None => Variables::new(),
        Some(v) if v.is_unit() => Variables::new(),
        Some(v) => {
            let Some(values) = v.clone().try_cast::<Map>() else {
                return Err(SandboxFailure::MalformedResult(format!(
                    "'value' must be an object map, got {}",
                    v.type_name()
                )));
            };
            values
                .iter()
                .map(|(key, item)| (key.to_string(), stringify(item)))
                .collect()
        }
    };

    Ok(Normalized { code, error, vars })
}

fn read_code(value: Option<&Dynamic>) -> Result<i64, SandboxFailure> {
    let Some(value) = value else {
        return Ok(exit_code::SUCCESS);
    };
    if value.is_unit() {
        return Ok(exit_code::SUCCESS);
    }
    if let Ok(code) = value.as_int() {
        return Ok(code);
    }
    if let Ok(code) = value.as_float() {
        return Ok(code as i64);
    }
    if value.is_string() {
        if let Ok(code) = stringify(value).trim().parse::<i64>() {
            return Ok(code);
        }
    }
    Err(SandboxFailure::MalformedResult(format!(
        "'code' must be a number, got {}",
        value.type_name()
    )))
}

/// Strings pass through; ints, floats and bools are stringified
fn stringify(value: &Dynamic) -> String {
    if value.is_unit() {
        return String::new();
    }
    match value.clone().into_string() {
        Ok(s) => s,
        Err(_) => value.to_string(),
    }
}
