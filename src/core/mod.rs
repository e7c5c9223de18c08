//! Core execution logic.
//!
//! This module contains:
//! - Sandbox: Bounded, isolated script evaluation
//! - Validator: Requirement checks on results
//! - Runner: Step executor and checkpoint runner
//! - Scheduler: Timer and trigger dispatch
//! - Store: Synchronized registries with throttled flush

pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod store;
pub mod throttle;
pub mod triggers;
pub mod validator;

// Re-export commonly used types
pub use registry::{CheckpointRegistry, IdentityRegistry};
pub use runner::{CheckpointRunner, RunHooks, RunReport, StepExecutor};
pub use sandbox::{SandboxFailure, SandboxLimits, SandboxResult, SandboxScript, ScriptSandbox};
pub use scheduler::{
    EventId, EventKind, LifecycleState, ScheduledEvent, Scheduler, SchedulerError,
    SchedulerSettings,
};
pub use store::{EntryKey, StoreEntry, StoreError, StoreSettings, SyncStore};
pub use throttle::FlushThrottle;
pub use triggers::bind_checkpoints;
pub use validator::{validate, Validation};
