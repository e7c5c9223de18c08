//! Binds checkpoint triggers to scheduler events.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveTime, Timelike};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::domain::{Checkpoint, ExecuteEnvironment, TriggerKind};

use super::registry::CheckpointRegistry;
use super::runner::{CheckpointRunner, RunHooks, RunReport};
use super::scheduler::{EventId, ScheduledEvent, Scheduler};

/// Minimum gap between two firings of a wall-clock schedule
pub const SCHEDULE_THROTTLE: Duration = Duration::from_secs(60);

/// Register one scheduler event per triggered checkpoint.
///
/// Manual checkpoints are skipped, as are checkpoints whose trigger value
/// does not parse (with a warning). The checkpoint is looked up again each
/// time the event fires, so replaced definitions take effect without
/// re-binding.
pub fn bind_checkpoints(
    scheduler: &Scheduler,
    registry: &CheckpointRegistry,
    runner: &Arc<CheckpointRunner>,
    handle: &Handle,
) -> Vec<EventId> {
    let mut bound = Vec::new();

    for checkpoint in registry.list() {
        let label = checkpoint.qualified_name();
        let event = match event_for(&checkpoint, registry, runner, handle) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(reason) => {
                warn!(checkpoint = %label, %reason, "Skipping checkpoint with invalid trigger");
                continue;
            }
        };

        match scheduler.register(event) {
            Ok(id) => {
                info!(checkpoint = %label, trigger = ?checkpoint.trigger.kind, "Bound trigger");
                bound.push(id);
            }
            Err(e) => warn!(checkpoint = %label, error = %e, "Failed to bind trigger"),
        }
    }

    bound
}

fn event_for(
    checkpoint: &Checkpoint,
    registry: &CheckpointRegistry,
    runner: &Arc<CheckpointRunner>,
    handle: &Handle,
) -> Result<Option<ScheduledEvent>, crate::domain::DefinitionError> {
    let label = checkpoint.qualified_name();
    let fire = firing_block(checkpoint, registry, runner, handle);

    let event = match checkpoint.trigger.kind {
        TriggerKind::Manual => return Ok(None),
        TriggerKind::TimeInterval => {
            let interval = checkpoint.trigger.interval_duration()?;
            ScheduledEvent::timer(label, interval, fire)
        }
        TriggerKind::TimeSchedule => {
            let at = checkpoint.trigger.schedule_time()?;
            ScheduledEvent::trigger(
                label,
                SCHEDULE_THROTTLE,
                move || same_minute(Local::now().time(), at),
                fire,
            )
        }
    };

    Ok(Some(event))
}

fn firing_block(
    checkpoint: &Checkpoint,
    registry: &CheckpointRegistry,
    runner: &Arc<CheckpointRunner>,
    handle: &Handle,
) -> impl Fn() + Send + Sync + 'static {
    let section = checkpoint.section.clone();
    let name = checkpoint.name.clone();
    let registry = registry.clone();
    let runner = Arc::clone(runner);
    let handle = handle.clone();

    move || {
        let Some(current) = registry.get(&section, &name) else {
            warn!(%section, %name, "Triggered checkpoint no longer exists");
            return;
        };
        runner.spawn(
            &handle,
            current,
            ExecuteEnvironment::default(),
            RunHooks::silent(),
            log_report,
        );
    }
}

fn log_report(report: RunReport) {
    match report.run.abort_reason() {
        None => info!(
            checkpoint = %report.run.checkpoint,
            run_id = %report.run.id,
            "Scheduled run completed"
        ),
        Some(reason) => warn!(
            checkpoint = %report.run.checkpoint,
            run_id = %report.run.id,
            %reason,
            "Scheduled run aborted"
        ),
    }
}

fn same_minute(now: NaiveTime, at: NaiveTime) -> bool {
    now.hour() == at.hour() && now.minute() == at.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ambient::StaticEnvironment;
    use crate::adapters::scripts::{ExecutableScript, ScriptResolver};
    use crate::adapters::storage::FsStorage;
    use crate::core::scheduler::SchedulerSettings;
    use crate::core::store::StoreSettings;
    use crate::domain::{Step, Trigger};
    use tempfile::TempDir;

    struct NoScripts;

    impl ScriptResolver for NoScripts {
        fn resolve_script(&self, _: &str, _: &str) -> Option<Arc<dyn ExecutableScript>> {
            None
        }
        fn resolve_group(&self, _: &str, _: &str) -> Option<Arc<dyn ExecutableScript>> {
            None
        }
    }

    #[test]
    fn test_same_minute() {
        let at = NaiveTime::from_hms_opt(3, 30, 0).unwrap();
        assert!(same_minute(NaiveTime::from_hms_opt(3, 30, 59).unwrap(), at));
        assert!(!same_minute(NaiveTime::from_hms_opt(3, 31, 0).unwrap(), at));
        assert!(!same_minute(NaiveTime::from_hms_opt(15, 30, 0).unwrap(), at));
    }

    #[tokio::test]
    async fn test_binds_only_valid_triggers() {
        let temp = TempDir::new().unwrap();
        let registry: CheckpointRegistry = CheckpointRegistry::open(
            "checkpoints",
            temp.path(),
            Arc::new(FsStorage),
            &StoreSettings::default(),
            Handle::current(),
            Arc::new(|err| panic!("unexpected storage fault: {err}")),
        )
        .unwrap();

        let steps = || vec![Step::script("noop", "ops")];
        registry.replace(Checkpoint::new("hourly", "ops", steps()).with_trigger(Trigger::interval(3600)));
        registry.replace(Checkpoint::new("nightly", "ops", steps()).with_trigger(Trigger::schedule("03:00")));
        registry.replace(Checkpoint::new("by-hand", "ops", steps()));
        registry.replace(Checkpoint::new("broken", "ops", steps()).with_trigger(Trigger::schedule("25:99")));

        let runner = Arc::new(CheckpointRunner::new(
            Arc::new(NoScripts),
            Arc::new(StaticEnvironment::default()),
        ));
        let scheduler = Scheduler::new(SchedulerSettings::default(), Handle::current());

        let bound = bind_checkpoints(&scheduler, &registry, &runner, &Handle::current());
        assert_eq!(bound.len(), 2);
        assert_eq!(scheduler.event_count(), 2);
    }
}
