//! Adapter interfaces for external collaborators.
//!
//! The core only talks to the outside world through these traits:
//! script resolution, durable storage and ambient variables. Each comes with
//! a default implementation.

pub mod ambient;
pub mod scripts;
pub mod storage;

// Re-export the default implementations
pub use ambient::{AmbientEnvironment, ProcessEnvironment, StaticEnvironment};
pub use scripts::{ExecutableScript, ScriptLibrary, ScriptResolver};
pub use storage::{FsStorage, StorageBackend};
