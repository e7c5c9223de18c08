//! Durable storage backend for the synchronized stores.
//!
//! The stores only need a handful of directory-scoped operations; `FsStorage`
//! implements them on the local filesystem with atomic (tempfile + rename)
//! writes.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Directory-scoped byte storage
pub trait StorageBackend: Send + Sync {
    /// Entries directly under `dir`; a missing directory lists as empty
    fn list_entries(&self, dir: &Path) -> io::Result<Vec<StorageEntry>>;

    /// Bytes at `path`, or `None` if it does not exist
    fn read_entry(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replace `path` atomically
    fn write_entry_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// Delete a file or a whole directory; missing is not an error
    fn delete_entry(&self, path: &Path) -> io::Result<()>;

    fn ensure_directory(&self, path: &Path) -> io::Result<()>;
}

/// Local filesystem storage
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl StorageBackend for FsStorage {
    fn list_entries(&self, dir: &Path) -> io::Result<Vec<StorageEntry>> {
        let mut entries = Vec::new();

        let read_dir = match std::fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e),
        };

        for entry in read_dir {
            let entry = entry?;
            entries.push(StorageEntry {
                path: entry.path(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn read_entry(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_entry_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete_entry(&self, path: &Path) -> io::Result<()> {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn ensure_directory(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}
