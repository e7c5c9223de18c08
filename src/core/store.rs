//! Synchronized store: in-memory map with throttled durable flush.
//!
//! The map is the source of truth; disk is a mirror read only at startup.
//! Two locks keep slow I/O out of the mutation path:
//! - the execution lock guards the map and is held only to mutate or snapshot
//! - the sync lock serializes flushes with each other
//!
//! Layout on disk: `<base>/<section>/<name>.json`.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::adapters::storage::StorageBackend;
use crate::domain::sanitize_component;

use super::throttle::FlushThrottle;

const RECORD_EXTENSION: &str = "json";

/// Position of an entry in a store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub section: String,
    pub name: String,
}

impl EntryKey {
    /// Both components are made filesystem-safe
    pub fn new(section: &str, name: &str) -> Self {
        Self {
            section: sanitize_component(section),
            name: sanitize_component(name),
        }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.section, self.name)
    }
}

/// Anything a `SyncStore` can hold
pub trait StoreEntry: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Position in the store; build it with `EntryKey::new`
    fn key(&self) -> EntryKey;
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode '{key}': {source}")]
    Encode {
        key: EntryKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("Entry '{0}' already exists")]
    AlreadyExists(EntryKey),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Invoked when a background flush fails
pub type FaultHandler = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// Default fault handler: a store that cannot persist must not keep running
pub fn abort_on_fault() -> FaultHandler {
    Arc::new(|err| {
        error!(error = %err, "Unrecoverable storage fault, aborting");
        std::process::abort();
    })
}

/// Store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Minimum delay before a requested flush runs (default: 1s)
    #[serde(default = "default_flush_delay")]
    pub flush_delay_ms: u64,
}

fn default_flush_delay() -> u64 {
    1_000
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay(),
        }
    }
}

impl StoreSettings {
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

type Sections<T> = BTreeMap<String, BTreeMap<String, T>>;

struct StoreInner<T: StoreEntry> {
    label: String,
    base_dir: PathBuf,
    storage: Arc<dyn StorageBackend>,
    entries: Mutex<Sections<T>>,
    sync_lock: Mutex<()>,
    throttle: FlushThrottle,
    on_fault: FaultHandler,
}

/// In-memory registry mirrored to durable storage
pub struct SyncStore<T: StoreEntry> {
    inner: Arc<StoreInner<T>>,
}

impl<T: StoreEntry> Clone for SyncStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: StoreEntry> SyncStore<T> {
    /// Open the store at `base_dir`, loading everything persisted there.
    ///
    /// Undecodable records are deleted and skipped.
    pub fn open(
        label: &str,
        base_dir: impl Into<PathBuf>,
        storage: Arc<dyn StorageBackend>,
        settings: &StoreSettings,
        handle: Handle,
        on_fault: FaultHandler,
    ) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        let entries = load_entries::<T>(storage.as_ref(), &base_dir)?;
        let count: usize = entries.values().map(BTreeMap::len).sum();
        info!(store = label, count, dir = %base_dir.display(), "Loaded entries");

        Ok(Self {
            inner: Arc::new(StoreInner {
                label: label.to_string(),
                base_dir,
                storage,
                entries: Mutex::new(entries),
                sync_lock: Mutex::new(()),
                throttle: FlushThrottle::new(settings.flush_delay(), handle),
                on_fault,
            }),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    /// Insert a new entry; fails if the key is taken
    pub fn add(&self, entry: T) -> Result<(), StoreError> {
        let key = entry.key();
        {
            let mut entries = self.inner.lock_entries();
            let section = entries.entry(key.section.clone()).or_default();
            if section.contains_key(&key.name) {
                return Err(StoreError::AlreadyExists(key));
            }
            section.insert(key.name.clone(), entry);
        }
        debug!(store = %self.inner.label, %key, "Added entry");
        self.request_synchronize();
        Ok(())
    }

    /// Insert or overwrite; returns the previous entry
    pub fn replace(&self, entry: T) -> Option<T> {
        let key = entry.key();
        let previous = {
            let mut entries = self.inner.lock_entries();
            entries
                .entry(key.section.clone())
                .or_default()
                .insert(key.name.clone(), entry)
        };
        debug!(store = %self.inner.label, %key, "Replaced entry");
        self.request_synchronize();
        previous
    }

    /// Remove by key; returns the removed entry
    pub fn remove(&self, section: &str, name: &str) -> Option<T> {
        let key = EntryKey::new(section, name);
        let removed = {
            let mut entries = self.inner.lock_entries();
            let removed = entries
                .get_mut(&key.section)
                .and_then(|s| s.remove(&key.name));
            if entries.get(&key.section).is_some_and(BTreeMap::is_empty) {
                entries.remove(&key.section);
            }
            removed
        };
        if removed.is_some() {
            debug!(store = %self.inner.label, %key, "Removed entry");
            self.request_synchronize();
        }
        removed
    }

    pub fn get(&self, section: &str, name: &str) -> Option<T> {
        let key = EntryKey::new(section, name);
        self.inner
            .lock_entries()
            .get(&key.section)
            .and_then(|s| s.get(&key.name))
            .cloned()
    }

    /// All entries ordered by section, then name
    pub fn list(&self) -> Vec<T> {
        self.inner
            .lock_entries()
            .values()
            .flat_map(|s| s.values().cloned())
            .collect()
    }

    pub fn sections(&self) -> Vec<String> {
        self.inner.lock_entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask for a deferred flush; bursts coalesce into one
    pub fn request_synchronize(&self) -> bool {
        let inner = Arc::clone(&self.inner);
        self.inner.throttle.request(move || inner.flush_or_fault())
    }

    /// Flush now, reconciling deletions
    pub fn synchronize(&self) -> Result<(), StoreError> {
        self.inner.synchronize()
    }

    /// Deferred flushes started so far
    pub fn flush_count(&self) -> u64 {
        self.inner.throttle.runs()
    }
}

impl<T: StoreEntry> StoreInner<T> {
    fn lock_entries(&self) -> MutexGuard<'_, Sections<T>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn flush_or_fault(&self) {
        if let Err(e) = self.synchronize() {
            error!(store = %self.label, error = %e, "Flush failed");
            (self.on_fault)(&e);
        }
    }

    fn synchronize(&self) -> Result<(), StoreError> {
        // Execution lock only for the snapshot.
        let snapshot = self.lock_entries().clone();

        let _sync = self
            .sync_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.storage
            .ensure_directory(&self.base_dir)
            .map_err(io_error(&self.base_dir))?;
        self.reconcile_deletions(&snapshot)?;
        self.write_snapshot(&snapshot)?;

        let count: usize = snapshot.values().map(BTreeMap::len).sum();
        debug!(store = %self.label, count, "Synchronized");
        Ok(())
    }

    /// Delete on-disk records whose keys are gone from memory
    fn reconcile_deletions(&self, snapshot: &Sections<T>) -> Result<(), StoreError> {
        let storage = self.storage.as_ref();

        for section_entry in storage
            .list_entries(&self.base_dir)
            .map_err(io_error(&self.base_dir))?
        {
            if !section_entry.is_dir {
                continue;
            }
            let Some(section) = file_name(&section_entry.path) else {
                continue;
            };

            let Some(names) = snapshot.get(&section) else {
                debug!(store = %self.label, section, "Removing section");
                storage
                    .delete_entry(&section_entry.path)
                    .map_err(io_error(&section_entry.path))?;
                continue;
            };

            for entry in storage
                .list_entries(&section_entry.path)
                .map_err(io_error(&section_entry.path))?
            {
                if entry.is_dir || !is_record(&entry.path) {
                    continue;
                }
                let keep = record_name(&entry.path).is_some_and(|name| names.contains_key(&name));
                if !keep {
                    debug!(store = %self.label, path = %entry.path.display(), "Removing record");
                    storage
                        .delete_entry(&entry.path)
                        .map_err(io_error(&entry.path))?;
                }
            }
        }

        Ok(())
    }

    fn write_snapshot(&self, snapshot: &Sections<T>) -> Result<(), StoreError> {
        let storage = self.storage.as_ref();

        for (section, names) in snapshot {
            let dir = self.base_dir.join(section);
            storage.ensure_directory(&dir).map_err(io_error(&dir))?;

            for (name, item) in names {
                let bytes = serde_json::to_vec_pretty(item).map_err(|source| StoreError::Encode {
                    key: EntryKey {
                        section: section.clone(),
                        name: name.clone(),
                    },
                    source,
                })?;
                let path = dir.join(format!("{name}.{RECORD_EXTENSION}"));
                storage
                    .write_entry_atomic(&path, &bytes)
                    .map_err(io_error(&path))?;
            }
        }

        Ok(())
    }
}

fn load_entries<T: StoreEntry>(
    storage: &dyn StorageBackend,
    base_dir: &Path,
) -> Result<Sections<T>, StoreError> {
    storage
        .ensure_directory(base_dir)
        .map_err(io_error(base_dir))?;

    let mut entries: Sections<T> = BTreeMap::new();

    for section_entry in storage.list_entries(base_dir).map_err(io_error(base_dir))? {
        if !section_entry.is_dir {
            continue;
        }

        for entry in storage
            .list_entries(&section_entry.path)
            .map_err(io_error(&section_entry.path))?
        {
            if entry.is_dir || !is_record(&entry.path) {
                continue;
            }

            let Some(bytes) = storage
                .read_entry(&entry.path)
                .map_err(io_error(&entry.path))?
            else {
                continue;
            };

            match serde_json::from_slice::<T>(&bytes) {
                Ok(item) => {
                    let key = item.key();
                    entries.entry(key.section).or_default().insert(key.name, item);
                }
                Err(e) => {
                    warn!(path = %entry.path.display(), error = %e, "Dropping undecodable record");
                    storage
                        .delete_entry(&entry.path)
                        .map_err(io_error(&entry.path))?;
                }
            }
        }
    }

    Ok(entries)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

fn is_record(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
}

fn record_name(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}
