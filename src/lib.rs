//! stepwise - Scheduled multi-step operations runner
//!
//! Automates remote-operations workflows ("checkpoints") built from
//! reusable scripts. A checkpoint runs its steps in order, carrying
//! variables from one step to the next and checking requirements after
//! each step and at the end.
//!
//! # Architecture
//!
//! - Scripts run in a sandboxed `rhai` engine with a concurrency ceiling
//!   and a timeout
//! - Checkpoint and identity registries live in memory and are mirrored
//!   to disk by throttled, coalesced flushes
//! - A tick-driven scheduler fires checkpoints on intervals or wall-clock
//!   schedules
//!
//! # Modules
//!
//! - `adapters`: Boundary interfaces (scripts, storage, ambient variables)
//! - `core`: Sandbox, validator, runner, scheduler, stores
//! - `domain`: Data structures (Checkpoint, Requirement, Recipe, Run)
//! - `services`: Composition root
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Import a checkpoint definition
//! stepwise import nightly-backup.yaml
//!
//! # Run it once with an input variable
//! stepwise run ops nightly-backup --var RETENTION=7
//!
//! # Fire triggered checkpoints until Ctrl-C
//! stepwise serve
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod services;

// Re-export main types at crate root for convenience
pub use self::core::{CheckpointRunner, RunHooks, Scheduler, ScriptSandbox, SyncStore};
pub use domain::{Checkpoint, ExecuteEnvironment, ExecuteRecipe, Requirement, Run, RunState};
pub use services::Services;
