//! Checkpoint execution.
//!
//! Runs a checkpoint's steps strictly in order, threading one
//! `ExecuteEnvironment` through them, validating each step's requirements and
//! finally the checkpoint's own gate. Every failure ends the run; there is no
//! retry. Whatever happens, the caller gets an `ExecuteRecipe` back.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::adapters::ambient::AmbientEnvironment;
use crate::adapters::scripts::{ExecutableScript, ScriptResolver};
use crate::domain::recipe::{exit_code, EXEC_ERROR, EXEC_EXIT_CODE};
use crate::domain::{
    AbortReason, Checkpoint, ExecuteEnvironment, ExecuteRecipe, Run, Step, StepKind,
};

use super::validator::validate;

pub type TerminateFn = Arc<dyn Fn() -> bool + Send + Sync>;
pub type OutputFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type ProgressFn = Arc<dyn Fn(usize, &str) + Send + Sync>;

/// Caller callbacks threaded through a run
#[derive(Clone, Default)]
pub struct RunHooks {
    terminate: Option<TerminateFn>,
    output: Option<OutputFn>,
    progress: Option<ProgressFn>,
}

impl RunHooks {
    /// No cancellation, output discarded
    pub fn silent() -> Self {
        Self::default()
    }

    /// Polled before every step; `true` stops the run
    pub fn with_terminate(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.terminate = Some(Arc::new(f));
        self
    }

    /// Receives text produced by scripts
    pub fn with_output(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(f));
        self
    }

    /// Receives `(step index, checkpoint name)` as each step starts
    pub fn with_progress(mut self, f: impl Fn(usize, &str) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn should_terminate(&self) -> bool {
        self.terminate.as_ref().is_some_and(|f| f())
    }

    pub fn emit_output(&self, text: &str) {
        if let Some(f) = &self.output {
            f(text);
        }
    }

    pub fn emit_progress(&self, step_index: usize, checkpoint: &str) {
        if let Some(f) = &self.progress {
            f(step_index, checkpoint);
        }
    }
}

/// Final state of a run together with its result
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: Run,
    pub recipe: ExecuteRecipe,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        !self.run.is_running() && self.run.abort_reason().is_none()
    }
}

/// Result of a single step
enum StepOutcome {
    Passed(ExecuteRecipe),
    Aborted(AbortReason, ExecuteRecipe),
}

/// Resolves and executes one step
pub struct StepExecutor {
    resolver: Arc<dyn ScriptResolver>,
}

impl StepExecutor {
    pub fn new(resolver: Arc<dyn ScriptResolver>) -> Self {
        Self { resolver }
    }

    fn resolve(&self, step: &Step) -> Option<Arc<dyn ExecutableScript>> {
        match step.kind {
            StepKind::ScriptRef => self.resolver.resolve_script(&step.name, &step.section),
            StepKind::ScriptGroupRef => self.resolver.resolve_group(&step.name, &step.section),
        }
    }

    /// Run one step against the accumulated environment.
    ///
    /// The environment absorbs the step's variables whether or not it passes.
    async fn execute(
        &self,
        step_index: usize,
        step: &Step,
        server: Option<&str>,
        environment: &mut ExecuteEnvironment,
        hooks: &RunHooks,
    ) -> StepOutcome {
        let Some(executable) = self.resolve(step) else {
            let recipe = ExecuteRecipe {
                vars: environment.payload.clone(),
                ..ExecuteRecipe::failure(exit_code::RESOLUTION_FAILED, "unresolved")
            };
            return StepOutcome::Aborted(
                AbortReason::ResolutionFailed {
                    step_index,
                    name: step.name.clone(),
                    section: step.section.clone(),
                },
                recipe,
            );
        };

        let target = step.effective_target(server);
        debug!(step_index, script = %executable.label(), target = ?target, "Executing step");

        let step_environment = environment.clone().with_target(target);
        let returned = executable.execute(step_environment, hooks).await;
        environment.merge(&returned.vars);

        let recipe = ExecuteRecipe {
            vars: environment.payload.clone(),
            ..returned
        };

        if recipe.code < 0 {
            let reason = AbortReason::NegativeExitCode {
                step_index,
                code: recipe.code,
                detail: recipe.error.clone(),
            };
            return StepOutcome::Aborted(reason, recipe);
        }

        let validation = validate(&recipe, &step.requirement);
        if let Some(descriptor) = validation.failure {
            return StepOutcome::Aborted(
                AbortReason::Requirement {
                    step_index,
                    descriptor,
                },
                recipe,
            );
        }

        StepOutcome::Passed(recipe)
    }
}

/// Drives checkpoint runs
pub struct CheckpointRunner {
    executor: StepExecutor,
    ambient: Arc<dyn AmbientEnvironment>,
}

impl CheckpointRunner {
    pub fn new(resolver: Arc<dyn ScriptResolver>, ambient: Arc<dyn AmbientEnvironment>) -> Self {
        Self {
            executor: StepExecutor::new(resolver),
            ambient,
        }
    }

    /// Run a checkpoint and return its result
    pub async fn execute(
        &self,
        checkpoint: &Checkpoint,
        input: ExecuteEnvironment,
        hooks: &RunHooks,
    ) -> ExecuteRecipe {
        self.run(checkpoint, input, hooks).await.recipe
    }

    /// Run a checkpoint, keeping the run bookkeeping
    #[instrument(skip(self, checkpoint, input, hooks), fields(checkpoint = %checkpoint.qualified_name()))]
    pub async fn run(
        &self,
        checkpoint: &Checkpoint,
        input: ExecuteEnvironment,
        hooks: &RunHooks,
    ) -> RunReport {
        let mut run = Run::new(checkpoint.qualified_name());
        info!(run_id = %run.id, steps = checkpoint.steps.len(), "Starting checkpoint");

        if input.target.is_some() {
            let recipe = ExecuteRecipe::success(input.payload);
            return abort(run, AbortReason::TargetPreassigned, recipe);
        }

        let mut environment = ExecuteEnvironment::new(self.ambient.current_ambient_variables());
        environment.merge(&input.payload);

        let mut last = ExecuteRecipe::success(environment.payload.clone());

        for (step_index, step) in checkpoint.steps.iter().enumerate() {
            run.enter_step(step_index);

            if hooks.should_terminate() {
                let recipe = ExecuteRecipe {
                    vars: environment.payload.clone(),
                    ..last
                };
                return abort(run, AbortReason::Terminated { step_index }, recipe);
            }
            hooks.emit_progress(step_index, &checkpoint.name);

            match self
                .executor
                .execute(
                    step_index,
                    step,
                    checkpoint.server.as_deref(),
                    &mut environment,
                    hooks,
                )
                .await
            {
                StepOutcome::Passed(recipe) => {
                    run.step_passed();
                    last = recipe;
                }
                StepOutcome::Aborted(reason, recipe) => return abort(run, reason, recipe),
            }
        }

        let validation = validate(&last, &checkpoint.final_requirement);
        if let Some(descriptor) = validation.failure {
            return abort(run, AbortReason::FinalRequirement { descriptor }, last);
        }

        run.complete();
        info!(run_id = %run.id, code = last.code, "Checkpoint completed");
        RunReport { run, recipe: last }
    }

    /// Run to completion on `handle`, blocking the calling thread.
    ///
    /// Must not be called from inside the runtime.
    pub fn execute_blocking(
        &self,
        handle: &Handle,
        checkpoint: &Checkpoint,
        input: ExecuteEnvironment,
        hooks: &RunHooks,
    ) -> ExecuteRecipe {
        handle.block_on(self.execute(checkpoint, input, hooks))
    }

    /// Run on `handle` and deliver the report to `completion`
    pub fn spawn<F>(
        self: &Arc<Self>,
        handle: &Handle,
        checkpoint: Checkpoint,
        input: ExecuteEnvironment,
        hooks: RunHooks,
        completion: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(RunReport) + Send + 'static,
    {
        let runner = Arc::clone(self);
        handle.spawn(async move {
            let report = runner.run(&checkpoint, input, &hooks).await;
            completion(report);
        })
    }
}

/// Collapse any abort to code -1, keeping the underlying code in `ExecExitCode`
fn abort(mut run: Run, reason: AbortReason, mut recipe: ExecuteRecipe) -> RunReport {
    let original = match reason {
        AbortReason::Requirement { .. } | AbortReason::FinalRequirement { .. } => recipe.code,
        _ => reason.original_code(),
    };
    let message = reason.to_string();

    warn!(run_id = %run.id, original_code = original, reason = %message, "Checkpoint aborted");

    recipe.vars.insert(EXEC_EXIT_CODE.to_string(), original.to_string());
    recipe.vars.insert(EXEC_ERROR.to_string(), message.clone());
    recipe.code = exit_code::ABORTED;
    recipe.error = Some(message);

    run.abort(reason);
    RunReport { run, recipe }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ambient::StaticEnvironment;
    use crate::domain::{Requirement, RequirementKind, RunState, Variables};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns a fixed recipe and records the environment it saw
    struct Canned {
        recipe: ExecuteRecipe,
        seen: Mutex<Vec<ExecuteEnvironment>>,
    }

    #[async_trait]
    impl ExecutableScript for Canned {
        fn label(&self) -> String {
            "test/canned".to_string()
        }

        async fn execute(&self, environment: ExecuteEnvironment, _hooks: &RunHooks) -> ExecuteRecipe {
            self.seen.lock().unwrap().push(environment);
            self.recipe.clone()
        }
    }

    #[derive(Default)]
    struct Resolver {
        scripts: HashMap<String, Arc<Canned>>,
    }

    impl Resolver {
        fn with(mut self, name: &str, recipe: ExecuteRecipe) -> Self {
            self.scripts.insert(
                name.to_string(),
                Arc::new(Canned {
                    recipe,
                    seen: Mutex::new(Vec::new()),
                }),
            );
            self
        }
    }

    impl ScriptResolver for Resolver {
        fn resolve_script(&self, name: &str, _section: &str) -> Option<Arc<dyn ExecutableScript>> {
            self.scripts
                .get(name)
                .map(|s| Arc::clone(s) as Arc<dyn ExecutableScript>)
        }

        fn resolve_group(&self, _name: &str, _section: &str) -> Option<Arc<dyn ExecutableScript>> {
            None
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn runner(resolver: Resolver) -> CheckpointRunner {
        CheckpointRunner::new(
            Arc::new(resolver),
            Arc::new(StaticEnvironment::default().with("REGION", "eu").with("MODE", "ambient")),
        )
    }

    #[tokio::test]
    async fn test_caller_payload_overrides_ambient() {
        let resolver = Resolver::default().with("a", ExecuteRecipe::success(Variables::new()));
        let canned = Arc::clone(&resolver.scripts["a"]);
        let runner = runner(resolver);

        let checkpoint = Checkpoint::new("cp", "ops", vec![Step::script("a", "ops")]);
        let input = ExecuteEnvironment::new(vars(&[("MODE", "caller")]));
        let recipe = runner.execute(&checkpoint, input, &RunHooks::silent()).await;

        assert_eq!(recipe.code, 0);
        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen[0].payload.get("MODE"), Some(&"caller".to_string()));
        assert_eq!(seen[0].payload.get("REGION"), Some(&"eu".to_string()));
    }

    #[tokio::test]
    async fn test_preassigned_target_is_rejected() {
        let runner = runner(Resolver::default());
        let checkpoint = Checkpoint::new("cp", "ops", vec![Step::script("a", "ops")]);
        let input = ExecuteEnvironment::default().with_target(Some("db-1".to_string()));

        let report = runner.run(&checkpoint, input, &RunHooks::silent()).await;
        assert_eq!(report.recipe.code, exit_code::ABORTED);
        assert!(matches!(
            report.run.state,
            RunState::Aborted {
                reason: AbortReason::TargetPreassigned
            }
        ));
    }

    #[tokio::test]
    async fn test_step_target_overrides_server() {
        let resolver = Resolver::default().with("a", ExecuteRecipe::success(Variables::new()));
        let canned = Arc::clone(&resolver.scripts["a"]);
        let runner = runner(resolver);

        let checkpoint = Checkpoint::new(
            "cp",
            "ops",
            vec![Step::script("a", "ops"), Step::script("a", "ops").with_target("db-2")],
        )
        .with_server("web-1");
        runner
            .execute(&checkpoint, ExecuteEnvironment::default(), &RunHooks::silent())
            .await;

        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen[0].target.as_deref(), Some("web-1"));
        assert_eq!(seen[1].target.as_deref(), Some("db-2"));
    }

    #[tokio::test]
    async fn test_unresolved_step_aborts() {
        let runner = runner(Resolver::default());
        let checkpoint = Checkpoint::new("cp", "ops", vec![Step::group("missing", "ops")]);

        let report = runner
            .run(&checkpoint, ExecuteEnvironment::default(), &RunHooks::silent())
            .await;
        assert_eq!(report.recipe.code, exit_code::ABORTED);
        assert_eq!(report.recipe.vars.get(EXEC_EXIT_CODE), Some(&"-20".to_string()));
        assert!(report.recipe.error.unwrap().contains("ops/missing"));
    }

    #[tokio::test]
    async fn test_requirement_failure_keeps_step_code() {
        let resolver = Resolver::default().with("a", ExecuteRecipe {
            code: 2,
            ..ExecuteRecipe::success(vars(&[("status", "degraded")]))
        });
        let runner = runner(resolver);
        let checkpoint = Checkpoint::new(
            "cp",
            "ops",
            vec![Step::script("a", "ops").with_requirement(
                Requirement::new(RequirementKind::Contains, Some("status".to_string()), "healthy")
                    .unwrap(),
            )],
        );

        let recipe = runner
            .execute(&checkpoint, ExecuteEnvironment::default(), &RunHooks::silent())
            .await;
        assert_eq!(recipe.code, exit_code::ABORTED);
        assert_eq!(recipe.vars.get(EXEC_EXIT_CODE), Some(&"2".to_string()));
        assert!(recipe.error.unwrap().contains("[status]: contains -> healthy"));
    }

    #[tokio::test]
    async fn test_terminate_and_progress() {
        let resolver = Resolver::default().with("a", ExecuteRecipe::success(Variables::new()));
        let runner = runner(resolver);
        let checkpoint = Checkpoint::new(
            "cp",
            "ops",
            vec![Step::script("a", "ops"), Step::script("a", "ops"), Step::script("a", "ops")],
        );

        let progressed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&progressed);
        let check = Arc::clone(&progressed);
        let hooks = RunHooks::silent()
            .with_progress(move |_, name| {
                assert_eq!(name, "cp");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .with_terminate(move || check.load(Ordering::SeqCst) >= 2);

        let report = runner
            .run(&checkpoint, ExecuteEnvironment::default(), &hooks)
            .await;
        assert_eq!(progressed.load(Ordering::SeqCst), 2);
        assert_eq!(report.run.steps_completed, 2);
        assert!(matches!(
            report.run.state,
            RunState::Aborted {
                reason: AbortReason::Terminated { step_index: 2 }
            }
        ));
    }

    #[tokio::test]
    async fn test_spawn_delivers_report() {
        let resolver = Resolver::default().with("a", ExecuteRecipe::success(vars(&[("x", "1")])));
        let runner = Arc::new(runner(resolver));
        let checkpoint = Checkpoint::new("cp", "ops", vec![Step::script("a", "ops")]);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = runner.spawn(
            &Handle::current(),
            checkpoint,
            ExecuteEnvironment::default(),
            RunHooks::silent(),
            move |report| {
                let _ = tx.send(report);
            },
        );

        let report = rx.await.unwrap();
        handle.await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.recipe.vars.get("x"), Some(&"1".to_string()));
    }

    #[test]
    fn test_execute_blocking() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let resolver = Resolver::default().with("a", ExecuteRecipe::success(vars(&[("x", "1")])));
        let runner = runner(resolver);
        let checkpoint = Checkpoint::new("cp", "ops", vec![Step::script("a", "ops")]);

        let recipe = runner.execute_blocking(
            rt.handle(),
            &checkpoint,
            ExecuteEnvironment::default(),
            &RunHooks::silent(),
        );
        assert_eq!(recipe.code, 0);
    }
}
