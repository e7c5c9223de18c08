//! Composition root.
//!
//! Builds every long-lived service once, from a resolved configuration, and
//! hands out shared references. Nothing in the crate reaches for a global.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tracing::info;

use crate::adapters::ambient::{AmbientEnvironment, ProcessEnvironment};
use crate::adapters::scripts::{ScriptLibrary, ScriptResolver};
use crate::adapters::storage::{FsStorage, StorageBackend};
use crate::config::ResolvedConfig;
use crate::core::registry::{CheckpointRegistry, IdentityRegistry};
use crate::core::runner::CheckpointRunner;
use crate::core::sandbox::ScriptSandbox;
use crate::core::scheduler::Scheduler;
use crate::core::store::{abort_on_fault, FaultHandler, SyncStore};

/// Process-scoped services
pub struct Services {
    pub config: ResolvedConfig,
    pub sandbox: Arc<ScriptSandbox>,
    pub checkpoints: CheckpointRegistry,
    pub identities: IdentityRegistry,
    pub runner: Arc<CheckpointRunner>,
    pub scheduler: Scheduler,
    pub handle: Handle,
}

/// Pluggable parts of the service graph
pub struct ServiceOverrides {
    pub storage: Arc<dyn StorageBackend>,
    pub resolver: Option<Arc<dyn ScriptResolver>>,
    pub ambient: Option<Arc<dyn AmbientEnvironment>>,
    pub on_fault: FaultHandler,
}

impl Default for ServiceOverrides {
    fn default() -> Self {
        Self {
            storage: Arc::new(FsStorage),
            resolver: None,
            ambient: None,
            on_fault: abort_on_fault(),
        }
    }
}

impl Services {
    /// Wire up the default implementations
    pub fn build(config: ResolvedConfig, handle: Handle) -> Result<Self> {
        Self::build_with(config, handle, ServiceOverrides::default())
    }

    pub fn build_with(
        config: ResolvedConfig,
        handle: Handle,
        overrides: ServiceOverrides,
    ) -> Result<Self> {
        let sandbox = Arc::new(ScriptSandbox::new(config.sandbox.clone()));

        let checkpoints: CheckpointRegistry = SyncStore::open(
            "checkpoints",
            config.checkpoints_dir(),
            Arc::clone(&overrides.storage),
            &config.store,
            handle.clone(),
            Arc::clone(&overrides.on_fault),
        )
        .context("Failed to open checkpoint registry")?;

        let identities: IdentityRegistry = SyncStore::open(
            "identities",
            config.identities_dir(),
            Arc::clone(&overrides.storage),
            &config.store,
            handle.clone(),
            Arc::clone(&overrides.on_fault),
        )
        .context("Failed to open identity registry")?;

        let resolver = overrides.resolver.unwrap_or_else(|| {
            Arc::new(ScriptLibrary::new(&config.scripts, Arc::clone(&sandbox)))
        });
        let ambient = overrides.ambient.unwrap_or_else(|| {
            Arc::new(ProcessEnvironment::with_prefix(config.ambient_prefix.clone()))
        });
        let runner = Arc::new(CheckpointRunner::new(resolver, ambient));
        let scheduler = Scheduler::new(config.scheduler.clone(), handle.clone());

        info!(
            home = %config.home.display(),
            checkpoints = checkpoints.len(),
            identities = identities.len(),
            "Services ready"
        );

        Ok(Self {
            config,
            sandbox,
            checkpoints,
            identities,
            runner,
            scheduler,
            handle,
        })
    }

    /// Flush both registries now
    pub fn flush(&self) -> Result<()> {
        self.checkpoints
            .synchronize()
            .context("Failed to flush checkpoints")?;
        self.identities
            .synchronize()
            .context("Failed to flush identities")?;
        Ok(())
    }
}
