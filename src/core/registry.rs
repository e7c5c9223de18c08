//! Concrete registries backed by `SyncStore`.

use uuid::Uuid;

use crate::domain::{Checkpoint, Identity};

use super::store::{EntryKey, StoreEntry, SyncStore};

/// Checkpoint definitions keyed by `(section, name)`
pub type CheckpointRegistry = SyncStore<Checkpoint>;

/// Credential records keyed by `(group, id)`
pub type IdentityRegistry = SyncStore<Identity>;

impl StoreEntry for Checkpoint {
    fn key(&self) -> EntryKey {
        EntryKey::new(&self.section, &self.name)
    }
}

impl StoreEntry for Identity {
    fn key(&self) -> EntryKey {
        EntryKey::new(&self.group, &self.id.to_string())
    }
}

impl SyncStore<Identity> {
    /// Find an identity by id regardless of group
    pub fn find_by_id(&self, id: Uuid) -> Option<Identity> {
        self.list().into_iter().find(|identity| identity.id == id)
    }
}

impl SyncStore<Checkpoint> {
    /// Checkpoints in one section
    pub fn in_section(&self, section: &str) -> Vec<Checkpoint> {
        self.list()
            .into_iter()
            .filter(|checkpoint| checkpoint.section == section)
            .collect()
    }
}
