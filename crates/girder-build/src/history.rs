//! Action history: the producing-attributes fingerprint recorded for every
//! file the engine has built.
//!
//! When an action's command line (or tool version) drifts, the fingerprint
//! stops matching and the outdatedness engine re-runs the action even though
//! timestamps look fresh.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use girder_types::Result;

use crate::archive;

const HISTORY_MAGIC: [u8; 4] = *b"GHST";
const HISTORY_VERSION: u32 = 3;

/// Number of lock shards. Probes against distinct files usually land in
/// different shards and proceed in parallel; probes against the same file
/// always serialize on its shard.
const SHARD_COUNT: usize = 16;

/// Persistent map from produced file to the producing attributes last
/// observed for it.
pub struct ActionHistory {
    archive_path: PathBuf,
    shards: Vec<Mutex<HashMap<PathBuf, String>>>,
    modified: AtomicBool,
}

impl ActionHistory {
    /// Load a history archive, starting empty when it is missing or invalid.
    pub fn load(archive_path: impl Into<PathBuf>) -> Self {
        let archive_path = archive_path.into();
        let entries: HashMap<PathBuf, String> =
            archive::read_archive(&archive_path, HISTORY_MAGIC, HISTORY_VERSION).unwrap_or_default();

        let mut shards: Vec<HashMap<PathBuf, String>> =
            (0..SHARD_COUNT).map(|_| HashMap::new()).collect();
        for (path, attrs) in entries {
            let shard = Self::shard_index(&path);
            shards[shard].insert(path, attrs);
        }

        Self {
            archive_path,
            shards: shards.into_iter().map(Mutex::new).collect(),
            modified: AtomicBool::new(false),
        }
    }

    fn shard_index(path: &Path) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        path.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    /// Atomically swap the recorded producing attributes for `file`.
    ///
    /// Returns `true` when a prior value existed and differed from
    /// `new_attributes`.
    pub fn update_producing_attributes(&self, file: &Path, new_attributes: &str) -> bool {
        let shard = &self.shards[Self::shard_index(file)];
        let mut entries = shard.lock().expect("action history shard lock");
        let previous = entries.insert(file.to_path_buf(), new_attributes.to_string());
        let changed = match previous {
            Some(ref old) => old != new_attributes,
            None => false,
        };
        if changed || previous.is_none() {
            self.modified.store(true, Ordering::Release);
        }
        changed
    }

    /// The currently recorded attributes for `file`, if any.
    pub fn producing_attributes(&self, file: &Path) -> Option<String> {
        let shard = &self.shards[Self::shard_index(file)];
        shard
            .lock()
            .expect("action history shard lock")
            .get(file)
            .cloned()
    }

    /// Persist the history if anything changed since load.
    pub fn save(&self) -> Result<()> {
        if !self.modified.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut entries: HashMap<PathBuf, String> = HashMap::new();
        for shard in &self.shards {
            let guard = shard.lock().expect("action history shard lock");
            entries.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        archive::write_archive(&self.archive_path, HISTORY_MAGIC, HISTORY_VERSION, &entries)?;
        self.modified.store(false, Ordering::Release);
        Ok(())
    }
}

/// Histories partitioned by mount point: one for the engine root and one per
/// project root, routed by path ancestry with the first mount as fallback.
#[derive(Default)]
pub struct ActionHistorySet {
    partitions: Vec<(PathBuf, ActionHistory)>,
}

impl ActionHistorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, base_dir: impl Into<PathBuf>, archive_path: impl Into<PathBuf>) {
        self.partitions
            .push((base_dir.into(), ActionHistory::load(archive_path)));
    }

    fn history_for(&self, file: &Path) -> Option<&ActionHistory> {
        self.partitions
            .iter()
            .find(|(base, _)| file.starts_with(base))
            .map(|(_, h)| h)
            .or_else(|| self.partitions.first().map(|(_, h)| h))
    }

    /// See [`ActionHistory::update_producing_attributes`]. Returns `false`
    /// when no partition is mounted.
    pub fn update_producing_attributes(&self, file: &Path, new_attributes: &str) -> bool {
        match self.history_for(file) {
            Some(history) => history.update_producing_attributes(file, new_attributes),
            None => false,
        }
    }

    pub fn producing_attributes(&self, file: &Path) -> Option<String> {
        self.history_for(file)?.producing_attributes(file)
    }

    /// Flush every modified partition. Called once at the end of a build.
    pub fn save(&self) -> Result<()> {
        for (_, history) in &self.partitions {
            history.save()?;
        }
        Ok(())
    }
}
