//! Domain types for the stepwise engine.
//!
//! This module contains the core data structures:
//! - Checkpoint: steps, triggers and gates
//! - Requirement: postconditions on a result
//! - Recipe: execution environment and results
//! - Identity: credential registry records
//! - Run: state of a single checkpoint execution

pub mod checkpoint;
pub mod identity;
pub mod recipe;
pub mod requirement;
pub mod run;

// Re-export commonly used types
pub use checkpoint::{sanitize_component, Checkpoint, Step, StepKind, Trigger, TriggerKind};
pub use identity::Identity;
pub use recipe::{exit_code, ExecuteEnvironment, ExecuteRecipe, Variables};
pub use requirement::{DefinitionError, Requirement, RequirementKind};
pub use run::{AbortReason, Run, RunState};
