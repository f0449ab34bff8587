//! The build session: owns the caches and drives the CORE A dataflow.
//!
//! Per target: obtain a makefile (cached or fresh from the toolchain), then
//! merge, link, check, compute outdatedness, and hand the outdated subset to
//! an executor. Caches are flushed once at the end, whatever the outcome.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use girder_types::{GirderError, Result};

use crate::depcache::DependencyCache;
use crate::executor::{finalize_execution, ActionExecutor};
use crate::export::write_action_graph;
use crate::file_item::FileItemCache;
use crate::history::ActionHistorySet;
use crate::link::{check_for_conflicts, check_path_lengths, link, merge_action_sets};
use crate::makefile::TargetMakefile;
use crate::outdated::{compute_outdated, prepare_outdated, OutdatedContext, OutdatedOptions};
use crate::toolchain::{TargetDescriptor, ToolchainAdapter};

/// Default warning threshold for output paths nested below the engine root.
const DEFAULT_NESTED_PATH_LIMIT: usize = 96;

/// Everything configurable about one build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub engine_root: PathBuf,
    /// Where makefiles and cache archives live.
    pub intermediate_dir: PathBuf,
    pub project_file: PathBuf,
    pub additional_arguments: Vec<String>,
    /// Plan only; do not execute.
    pub skip_build: bool,
    /// Refuse builds that would modify files under the engine root.
    pub no_engine_changes: bool,
    pub ignore_outdated_import_libraries: bool,
    pub skip_prebuild_targets: bool,
    /// Export the full linked action graph as JSON to this path, for
    /// external build distribution frontends.
    pub export: Option<PathBuf>,
    /// Dump the outdated action set as JSON to this path before executing.
    pub write_outdated_actions: Option<PathBuf>,
    pub max_parallel_actions: usize,
    pub nested_path_length_limit: usize,
}

impl BuildOptions {
    pub fn new(engine_root: impl Into<PathBuf>, intermediate_dir: impl Into<PathBuf>) -> Self {
        let engine_root = engine_root.into();
        Self {
            project_file: engine_root.join("engine.project"),
            engine_root,
            intermediate_dir: intermediate_dir.into(),
            additional_arguments: Vec::new(),
            skip_build: false,
            no_engine_changes: false,
            ignore_outdated_import_libraries: false,
            skip_prebuild_targets: false,
            export: None,
            write_outdated_actions: None,
            max_parallel_actions: 4,
            nested_path_length_limit: DEFAULT_NESTED_PATH_LIMIT,
        }
    }
}

/// Summary of one `build_targets` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    /// Total actions across all merged targets.
    pub planned_actions: usize,
    /// Actions that were outdated and scheduled to run.
    pub outdated_actions: usize,
    /// False when `skip_build` suppressed execution.
    pub executed: bool,
}

/// Owns the process-wide caches and the build options. Passed to components
/// explicitly rather than living in globals.
pub struct BuildSession {
    pub file_items: FileItemCache,
    pub dep_cache: DependencyCache,
    pub history: ActionHistorySet,
    pub options: BuildOptions,
}

impl BuildSession {
    /// Create a session, mounting one cache partition per project root and
    /// one for the engine root (project partitions first so ancestry routing
    /// prefers them).
    pub fn new(options: BuildOptions) -> Self {
        let dep_cache = DependencyCache::new();
        let mut history = ActionHistorySet::new();

        if let Some(project_root) = options.project_file.parent() {
            if project_root != options.engine_root {
                dep_cache.mount(
                    project_root,
                    options.intermediate_dir.join("project.depcache.bin"),
                );
                history.mount(
                    project_root,
                    options.intermediate_dir.join("project.history.bin"),
                );
            }
        }
        dep_cache.mount(
            &options.engine_root,
            options.intermediate_dir.join("engine.depcache.bin"),
        );
        history.mount(
            &options.engine_root,
            options.intermediate_dir.join("engine.history.bin"),
        );

        Self {
            file_items: FileItemCache::new(),
            dep_cache,
            history,
            options,
        }
    }

    fn makefile_path(&self, target: &TargetDescriptor) -> PathBuf {
        self.options.intermediate_dir.join(format!(
            "{}-{}-{}.makefile.bin",
            target.name, target.platform, target.configuration
        ))
    }

    /// Load the target's cached makefile if it is still valid, otherwise ask
    /// the toolchain for a fresh one and persist it.
    async fn obtain_makefile(
        &self,
        target: &TargetDescriptor,
        toolchain: &dyn ToolchainAdapter,
    ) -> Result<TargetMakefile> {
        let path = self.makefile_path(target);

        let cached = TargetMakefile::load(
            &path,
            &self.options.project_file,
            &target.platform,
            &self.options.additional_arguments,
        );
        match cached {
            Ok(makefile) => {
                let sources = toolchain.current_source_files(target).await?;
                let working_set = toolchain.current_working_set(target).await?;
                match makefile.is_valid_for_source_files(&sources, &working_set) {
                    Ok(()) => {
                        tracing::debug!(build_target = %target, "using cached makefile");
                        for diagnostic in &makefile.diagnostics {
                            tracing::warn!(build_target = %target, "{diagnostic}");
                        }
                        return Ok(makefile);
                    }
                    Err(reason) => {
                        tracing::info!(build_target = %target, %reason, "makefile invalidated");
                    }
                }
            }
            Err(reason) => {
                tracing::info!(build_target = %target, %reason, "rebuilding makefile");
            }
        }

        let makefile = toolchain.create_makefile(target, self).await?;
        makefile.save(&path)?;
        Ok(makefile)
    }

    /// Drive the full CORE A dataflow for a set of targets.
    pub async fn build_targets(
        &self,
        targets: &[TargetDescriptor],
        toolchain: &dyn ToolchainAdapter,
        executor: &dyn ActionExecutor,
    ) -> Result<BuildOutcome> {
        let result = self.build_targets_inner(targets, toolchain, executor).await;

        // Caches flush regardless of how the build went; a failed compile
        // must not lose the dependency information gathered along the way.
        if let Err(e) = self.dep_cache.flush() {
            tracing::error!("failed to flush dependency cache: {e}");
        }
        if let Err(e) = self.history.save() {
            tracing::error!("failed to flush action history: {e}");
        }
        result
    }

    async fn build_targets_inner(
        &self,
        targets: &[TargetDescriptor],
        toolchain: &dyn ToolchainAdapter,
        executor: &dyn ActionExecutor,
    ) -> Result<BuildOutcome> {
        let mut action_sets: Vec<(String, Vec<crate::action::Action>)> = Vec::new();
        let mut environment: BTreeMap<String, String> = BTreeMap::new();
        let mut prebuild: Vec<TargetDescriptor> = Vec::new();

        for target in targets {
            let makefile = self.obtain_makefile(target, toolchain).await?;
            environment.extend(makefile.environment.clone());
            if !self.options.skip_prebuild_targets {
                for name in &makefile.prebuild_targets {
                    let implied = TargetDescriptor::new(
                        name.clone(),
                        target.platform.clone(),
                        target.configuration.clone(),
                    );
                    if !targets.contains(&implied) && !prebuild.contains(&implied) {
                        prebuild.push(implied);
                    }
                }
            }
            action_sets.push((target.name.clone(), makefile.actions));
        }

        for target in &prebuild {
            tracing::info!(build_target = %target, "including pre-build target");
            let makefile = self.obtain_makefile(target, toolchain).await?;
            environment.extend(makefile.environment.clone());
            action_sets.push((target.name.clone(), makefile.actions));
        }

        let merged = merge_action_sets(action_sets);
        check_for_conflicts(&merged)?;
        for warning in check_path_lengths(
            &merged,
            &self.options.engine_root,
            self.options.nested_path_length_limit,
        )? {
            tracing::warn!("{warning}");
        }
        let graph = link(merged)?;
        let planned_actions = graph.len();

        if let Some(path) = &self.options.export {
            write_action_graph(path, &graph, &environment)?;
            tracing::info!(
                actions = planned_actions,
                path = %path.display(),
                "exported action graph"
            );
        }

        let ctx = OutdatedContext {
            file_items: &self.file_items,
            dep_cache: &self.dep_cache,
            history: &self.history,
            options: OutdatedOptions {
                ignore_outdated_import_libraries: self.options.ignore_outdated_import_libraries,
            },
        };
        let outdated = compute_outdated(&graph, &ctx)?;
        tracing::info!(
            planned = planned_actions,
            outdated = outdated.len(),
            "outdatedness computed"
        );

        if self.options.no_engine_changes {
            let mut engine_files: BTreeSet<PathBuf> = BTreeSet::new();
            for &i in &outdated {
                for item in &graph.actions[i].action.produced_items {
                    if item.starts_with(&self.options.engine_root) {
                        engine_files.insert(item.clone());
                    }
                }
            }
            if !engine_files.is_empty() {
                return Err(GirderError::EngineChangesRefused {
                    files: engine_files.into_iter().collect(),
                });
            }
        }

        if outdated.is_empty() {
            return Ok(BuildOutcome {
                planned_actions,
                outdated_actions: 0,
                executed: true,
            });
        }

        if let Some(path) = &self.options.write_outdated_actions {
            let subset: Vec<_> = outdated
                .iter()
                .map(|&i| {
                    (
                        graph.actions[i].action.clone(),
                        graph.actions[i].group_names.clone(),
                    )
                })
                .collect();
            write_action_graph(path, &link(subset)?, &environment)?;
        }

        if self.options.skip_build {
            return Ok(BuildOutcome {
                planned_actions,
                outdated_actions: outdated.len(),
                executed: false,
            });
        }

        let subset = prepare_outdated(&graph, &outdated, &self.file_items)?;
        let succeeded = executor.execute(&subset).await?;
        if !succeeded {
            return Err(GirderError::ActionsFailed);
        }
        finalize_execution(&subset, &self.file_items)?;

        Ok(BuildOutcome {
            planned_actions,
            outdated_actions: outdated.len(),
            executed: true,
        })
    }
}
