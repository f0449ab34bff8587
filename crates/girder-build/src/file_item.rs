//! Canonical file handles with lazily cached metadata.
//!
//! Every path the engine touches goes through a [`FileItemCache`] so that a
//! given file is stat'ed at most once per build, and so that "this file
//! changed" can be expressed by resetting a single shared handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Cached filesystem metadata for one path.
#[derive(Debug, Clone, Copy)]
struct FileInfo {
    exists: bool,
    last_write_time: Option<SystemTime>,
    length: u64,
}

impl FileInfo {
    fn stat(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => Self {
                exists: true,
                last_write_time: meta.modified().ok(),
                length: meta.len(),
            },
            Err(_) => Self {
                exists: false,
                last_write_time: None,
                length: 0,
            },
        }
    }
}

/// A canonical handle for an absolute path.
///
/// At most one `FileItem` exists per path within a cache; metadata is stat'ed
/// on first access and only refreshed through [`reset_info`](Self::reset_info).
#[derive(Debug)]
pub struct FileItem {
    path: PathBuf,
    info: Mutex<Option<FileInfo>>,
}

impl FileItem {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            info: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn info(&self) -> FileInfo {
        let mut guard = self.info.lock().expect("file info lock");
        *guard.get_or_insert_with(|| FileInfo::stat(&self.path))
    }

    pub fn exists(&self) -> bool {
        self.info().exists
    }

    pub fn last_write_time(&self) -> Option<SystemTime> {
        self.info().last_write_time
    }

    pub fn length(&self) -> u64 {
        self.info().length
    }

    /// Discard cached metadata so the next access re-stats the file. Called
    /// after an executor batch returns, for every produced item.
    pub fn reset_info(&self) {
        *self.info.lock().expect("file info lock") = None;
    }
}

/// Interning cache for [`FileItem`]s, owned by the build session.
#[derive(Debug, Default)]
pub struct FileItemCache {
    items: Mutex<HashMap<PathBuf, Arc<FileItem>>>,
}

impl FileItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unique handle for `path`, creating it on first reference.
    pub fn item(&self, path: impl AsRef<Path>) -> Arc<FileItem> {
        let path = path.as_ref();
        let mut items = self.items.lock().expect("file item cache lock");
        if let Some(existing) = items.get(path) {
            return Arc::clone(existing);
        }
        let item = Arc::new(FileItem::new(path.to_path_buf()));
        items.insert(path.to_path_buf(), Arc::clone(&item));
        item
    }

    /// Number of interned handles, mostly useful for diagnostics.
    pub fn len(&self) -> usize {
        self.items.lock().expect("file item cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
