//! Per-target makefile cache.
//!
//! A target's makefile is the serialized plan of every action the toolchain
//! adapter emitted for it, plus enough of the surrounding state (arguments,
//! environment, source sets, generated directories) to decide on a later run
//! whether the plan is still valid or must be rebuilt.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use girder_types::Result;

use crate::action::Action;
use crate::archive;

const MAKEFILE_MAGIC: [u8; 4] = *b"GMKF";
const MAKEFILE_VERSION: u32 = 3;

/// The serialized build plan for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetMakefile {
    /// The project file this plan was produced for.
    pub project_file: PathBuf,
    pub platform: String,
    /// Extra command-line arguments in effect when the plan was produced.
    /// Any drift invalidates the makefile.
    pub additional_arguments: Vec<String>,
    pub actions: Vec<Action>,
    /// Ordered module name → output items map.
    pub module_outputs: Vec<(String, Vec<PathBuf>)>,
    /// Names of targets that must be built before this one.
    pub prebuild_targets: Vec<String>,
    pub prebuild_scripts: Vec<PathBuf>,
    /// Environment variables snapshotted when the plan was produced.
    pub environment: BTreeMap<String, String>,
    /// Toolchain diagnostics to replay on cached loads.
    pub diagnostics: Vec<String>,
    /// Hint for executors that budget by memory.
    pub memory_per_action_mb: u64,
    /// Source files per module at plan time.
    pub source_files: BTreeMap<String, BTreeSet<PathBuf>>,
    /// The adaptive working set (files the user was editing) at plan time.
    pub working_set: BTreeSet<PathBuf>,
    /// Generated-code directories and their listing at plan time.
    pub generated_directories: BTreeMap<PathBuf, BTreeSet<String>>,
}

fn list_directory(dir: &Path) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            names.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names
}

impl TargetMakefile {
    /// Capture the current listing of each generated directory. Called by
    /// the toolchain adapter right after producing the plan.
    pub fn snapshot_generated_directories(&mut self, directories: &[PathBuf]) {
        self.generated_directories = directories
            .iter()
            .map(|dir| (dir.clone(), list_directory(dir)))
            .collect();
    }

    /// Write the makefile as a versioned binary archive.
    pub fn save(&self, path: &Path) -> Result<()> {
        archive::write_archive(path, MAKEFILE_MAGIC, MAKEFILE_VERSION, self)
    }

    /// Load a makefile and check it against the current invocation.
    ///
    /// Returns the reason string when the makefile must be discarded: missing
    /// or unreadable archive, version mismatch, different project or
    /// platform, or drifted additional arguments.
    pub fn load(
        path: &Path,
        project_file: &Path,
        platform: &str,
        additional_arguments: &[String],
    ) -> std::result::Result<TargetMakefile, String> {
        let makefile: TargetMakefile =
            archive::read_archive(path, MAKEFILE_MAGIC, MAKEFILE_VERSION)
                .ok_or_else(|| format!("no valid makefile at {}", path.display()))?;

        if makefile.project_file != project_file {
            return Err(format!(
                "makefile was produced for project {}",
                makefile.project_file.display()
            ));
        }
        if makefile.platform != platform {
            return Err(format!(
                "makefile was produced for platform {}",
                makefile.platform
            ));
        }
        if makefile.additional_arguments != additional_arguments {
            return Err("command line arguments changed".to_string());
        }
        Ok(makefile)
    }

    /// Check the plan against the current source and working sets.
    ///
    /// Invalid when any module gained or lost a source file, when any file's
    /// membership in the adaptive working set flipped, or when a generated
    /// directory's contents changed.
    pub fn is_valid_for_source_files(
        &self,
        current_source_files: &BTreeMap<String, BTreeSet<PathBuf>>,
        current_working_set: &BTreeSet<PathBuf>,
    ) -> std::result::Result<(), String> {
        for (module, sources) in current_source_files {
            match self.source_files.get(module) {
                None => return Err(format!("module {module} is new")),
                Some(recorded) => {
                    if let Some(added) = sources.difference(recorded).next() {
                        return Err(format!(
                            "source file {} was added to {module}",
                            added.display()
                        ));
                    }
                    if let Some(removed) = recorded.difference(sources).next() {
                        return Err(format!(
                            "source file {} was removed from {module}",
                            removed.display()
                        ));
                    }
                }
            }
        }
        for module in self.source_files.keys() {
            if !current_source_files.contains_key(module) {
                return Err(format!("module {module} was removed"));
            }
        }

        if let Some(changed) = self
            .working_set
            .symmetric_difference(current_working_set)
            .next()
        {
            return Err(format!(
                "working set membership of {} changed",
                changed.display()
            ));
        }

        for (dir, recorded) in &self.generated_directories {
            let current = list_directory(dir);
            if &current != recorded {
                return Err(format!(
                    "contents of generated directory {} changed",
                    dir.display()
                ));
            }
        }
        Ok(())
    }
}
