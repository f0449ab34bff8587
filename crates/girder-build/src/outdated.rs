//! The outdatedness engine: decides which actions must re-run.
//!
//! Phase one inspects every action independently (timestamps, recorded
//! producing attributes, discovered dependency lists) and runs actions
//! concurrently across worker threads. Phase two sweeps the graph in
//! topological order so that anything downstream of an outdated action is
//! outdated too, modulo the import-library exception.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime};

use girder_types::{GirderError, Result};

use crate::action::ActionType;
use crate::depcache::DependencyCache;
use crate::file_item::{FileItem, FileItemCache};
use crate::history::ActionHistorySet;
use crate::link::{link, ActionGraph};

/// Slack allowed on prerequisite timestamps before an action is considered
/// stale. Covers files copied over the network with coarse clocks.
const TIMESTAMP_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct OutdatedOptions {
    /// When set, a dependency that is stale only through a rebuilt static
    /// import library does not mark the dependent outdated.
    pub ignore_outdated_import_libraries: bool,
}

/// Borrowed view of the session state the computation needs.
pub struct OutdatedContext<'a> {
    pub file_items: &'a FileItemCache,
    pub dep_cache: &'a DependencyCache,
    pub history: &'a ActionHistorySet,
    pub options: OutdatedOptions,
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Zero-length object files left behind by an aborted compile are treated as
/// nonexistent so they cannot satisfy the output check forever.
fn is_aborted_compile_output(action_type: ActionType, item: &FileItem) -> bool {
    action_type == ActionType::Compile
        && item.length() == 0
        && (has_extension(item.path(), "obj") || has_extension(item.path(), "o"))
}

fn newer_than_with_slack(mtime: SystemTime, last_execution: Option<SystemTime>) -> bool {
    match last_execution {
        None => true,
        Some(t) => mtime > t + TIMESTAMP_SLACK,
    }
}

/// Whether a single prerequisite item qualifies for the import-library
/// exception: a `.lib` produced by an action flagged as producing one.
fn is_import_library_item(graph: &ActionGraph, item: &Path) -> bool {
    if !has_extension(item, "lib") {
        return false;
    }
    graph
        .producer_of(item)
        .map(|p| graph.actions[p].action.produces_import_library)
        .unwrap_or(false)
}

/// Whether an outdated prerequisite action can be ignored by `dependent`:
/// the producer is flagged as import-library-producing and every one of its
/// outputs is either a `.lib` or not actually referenced by the dependent.
fn import_library_action_exception(graph: &ActionGraph, dependent: usize, producer: usize) -> bool {
    let producer_action = &graph.actions[producer].action;
    if !producer_action.produces_import_library {
        return false;
    }
    let dependent_prereqs = &graph.actions[dependent].action.prerequisite_items;
    producer_action
        .produced_items
        .iter()
        .all(|item| has_extension(item, "lib") || !dependent_prereqs.contains(item))
}

/// Phase one: decide whether one action is outdated on its own merits.
fn is_individually_outdated(graph: &ActionGraph, index: usize, ctx: &OutdatedContext<'_>) -> Result<bool> {
    let action = &graph.actions[index].action;
    let mut outdated = false;

    // Last execution time: the oldest produced item that exists.
    let mut last_execution: Option<SystemTime> = None;
    let mut all_outputs_exist = true;
    for item in &action.produced_items {
        let file = ctx.file_items.item(item);
        if !file.exists() || is_aborted_compile_output(action.action_type, &file) {
            all_outputs_exist = false;
            continue;
        }
        if let Some(mtime) = file.last_write_time() {
            last_execution = Some(match last_execution {
                Some(t) => t.min(mtime),
                None => mtime,
            });
        }
    }

    // Swap the producing attributes into the history for every produced
    // item, regardless of whether we already know the action is outdated.
    let new_attributes = action.producing_attributes();
    for item in &action.produced_items {
        let changed = ctx.history.update_producing_attributes(item, &new_attributes);
        if changed && action.use_action_history && ctx.file_items.item(item).exists() {
            tracing::debug!(item = %item.display(), "command line changed since last build");
            outdated = true;
        }
    }

    if !all_outputs_exist {
        tracing::debug!(action = %action.describe(), "output missing");
        return Ok(true);
    }
    if outdated {
        return Ok(true);
    }

    for item in &action.prerequisite_items {
        let file = ctx.file_items.item(item);
        if !file.exists() {
            continue;
        }
        if let Some(mtime) = file.last_write_time() {
            if newer_than_with_slack(mtime, last_execution) {
                if ctx.options.ignore_outdated_import_libraries
                    && is_import_library_item(graph, item)
                {
                    continue;
                }
                tracing::debug!(
                    action = %action.describe(),
                    prerequisite = %item.display(),
                    "prerequisite is newer than outputs"
                );
                return Ok(true);
            }
        }
    }

    if let Some(dep_file) = &action.dependency_list_file {
        // A dependency file the compiler left in a bad state is a cache
        // miss, not a build abort: log it and re-run the action, which
        // rewrites the file.
        let dependencies = match ctx.dep_cache.try_get_dependencies(dep_file) {
            Ok(dependencies) => dependencies,
            Err(e) if e.is_cache_recoverable() => {
                tracing::info!(action = %action.describe(), "{e}; re-running to rebuild it");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };
        match dependencies {
            None => {
                tracing::debug!(action = %action.describe(), "dependency list missing");
                return Ok(true);
            }
            Some(dependencies) => {
                for dependency in dependencies {
                    let file = ctx.file_items.item(&dependency);
                    if !file.exists() {
                        return Ok(true);
                    }
                    if let Some(mtime) = file.last_write_time() {
                        if newer_than_with_slack(mtime, last_execution) {
                            tracing::debug!(
                                action = %action.describe(),
                                dependency = %dependency.display(),
                                "discovered dependency is newer than outputs"
                            );
                            return Ok(true);
                        }
                    }
                }
            }
        }
    }

    Ok(false)
}

/// Compute the set of outdated actions in `graph`.
///
/// Returns the indices of outdated actions in ascending order.
pub fn compute_outdated(graph: &ActionGraph, ctx: &OutdatedContext<'_>) -> Result<Vec<usize>> {
    // Phase one, parallel across actions. Results land in a map behind a
    // single reader/writer lock; the first error wins and stops the sweep.
    let independent: RwLock<HashMap<usize, bool>> = RwLock::new(HashMap::new());
    let first_error: Mutex<Option<GirderError>> = Mutex::new(None);
    let next_index = AtomicUsize::new(0);

    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(graph.len().max(1));

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            scope.spawn(|| loop {
                let i = next_index.fetch_add(1, Ordering::SeqCst);
                if i >= graph.len() {
                    break;
                }
                if first_error.lock().expect("outdated error lock").is_some() {
                    break;
                }
                match is_individually_outdated(graph, i, ctx) {
                    Ok(value) => {
                        independent
                            .write()
                            .expect("outdated map lock")
                            .insert(i, value);
                    }
                    Err(e) => {
                        let mut guard = first_error.lock().expect("outdated error lock");
                        if guard.is_none() {
                            *guard = Some(e);
                        }
                        break;
                    }
                }
            });
        }
    });

    if let Some(e) = first_error.into_inner().expect("outdated error lock") {
        return Err(e);
    }
    let independent = independent.into_inner().expect("outdated map lock");

    // Phase two: topological sweep, dependencies first. Phase one memoized
    // the per-action answer, so this is a single O(V + E) pass.
    let mut outdated = vec![false; graph.len()];
    for &i in &graph.topo_order {
        let mut is_outdated = independent[&i];
        if !is_outdated {
            for &producer in &graph.actions[i].prerequisite_actions {
                if outdated[producer] {
                    if ctx.options.ignore_outdated_import_libraries
                        && import_library_action_exception(graph, i, producer)
                    {
                        continue;
                    }
                    is_outdated = true;
                    break;
                }
            }
        }
        outdated[i] = is_outdated;
    }

    Ok((0..graph.len()).filter(|&i| outdated[i]).collect())
}

/// Flatten the outdated subset into its own re-linked graph and prepare the
/// filesystem: delete stale outputs and declared delete-items, then create
/// the directories every output will be written into.
pub fn prepare_outdated(
    graph: &ActionGraph,
    outdated: &[usize],
    file_items: &FileItemCache,
) -> Result<ActionGraph> {
    let subset: Vec<_> = outdated
        .iter()
        .map(|&i| {
            let linked = &graph.actions[i];
            (linked.action.clone(), linked.group_names.clone())
        })
        .collect();
    let relinked = link(subset)?;

    for linked in &relinked.actions {
        for item in linked
            .action
            .produced_items
            .iter()
            .chain(&linked.action.delete_items)
        {
            match std::fs::remove_file(item) {
                Ok(()) => file_items.item(item).reset_info(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        for item in &linked.action.produced_items {
            if let Some(parent) = item.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    Ok(relinked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{test_action, Action};
    use crate::link::merge_action_sets;
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        dep_cache: DependencyCache,
        history: ActionHistorySet,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let dep_cache = DependencyCache::new();
            dep_cache.mount(&root, root.join("depcache.bin"));
            let mut history = ActionHistorySet::new();
            history.mount(&root, root.join("history.bin"));
            Self {
                _dir: dir,
                root,
                dep_cache,
                history,
            }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.root.join(name)
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.path(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn set_mtime(&self, path: &Path, time: SystemTime) {
            let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            file.set_modified(time).unwrap();
        }

        fn compute(&self, actions: Vec<Action>, options: OutdatedOptions) -> Vec<usize> {
            let graph = link(merge_action_sets(vec![("test".into(), actions)])).unwrap();
            let file_items = FileItemCache::new();
            let ctx = OutdatedContext {
                file_items: &file_items,
                dep_cache: &self.dep_cache,
                history: &self.history,
                options,
            };
            compute_outdated(&graph, &ctx).unwrap()
        }
    }

    fn action_for(fixture: &Fixture, produced: &str, prerequisite: &str, args: &str) -> Action {
        test_action(
            &[fixture.path(produced).to_str().unwrap()],
            &[fixture.path(prerequisite).to_str().unwrap()],
            args,
        )
    }

    #[test]
    fn missing_output_is_outdated() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        let outdated = fx.compute(
            vec![action_for(&fx, "out.bin", "in.src", "-o out.bin")],
            OutdatedOptions::default(),
        );
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn fresh_output_with_recorded_history_is_up_to_date() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let base = SystemTime::now();
        fx.set_mtime(&input, base - Duration::from_secs(60));
        fx.set_mtime(&output, base);

        let action = action_for(&fx, "out.bin", "in.src", "-o out.bin");
        // First pass records history (absent prior is not a change) and sees
        // fresh outputs.
        let outdated = fx.compute(vec![action.clone()], OutdatedOptions::default());
        assert!(outdated.is_empty());
        // Second pass is idempotent.
        let outdated = fx.compute(vec![action], OutdatedOptions::default());
        assert!(outdated.is_empty());
    }

    #[test]
    fn changed_command_line_is_outdated() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let base = SystemTime::now();
        fx.set_mtime(&input, base - Duration::from_secs(60));
        fx.set_mtime(&output, base);

        let outdated = fx.compute(
            vec![action_for(&fx, "out.bin", "in.src", "-o out.bin")],
            OutdatedOptions::default(),
        );
        assert!(outdated.is_empty());

        let outdated = fx.compute(
            vec![action_for(&fx, "out.bin", "in.src", "-O3 -o out.bin")],
            OutdatedOptions::default(),
        );
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn prerequisite_newer_than_slack_is_outdated() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let base = SystemTime::now();
        fx.set_mtime(&output, base);
        fx.set_mtime(&input, base + Duration::from_secs(2));

        let action = action_for(&fx, "out.bin", "in.src", "-o out.bin");
        let _ = fx.compute(vec![action.clone()], OutdatedOptions::default());
        let outdated = fx.compute(vec![action], OutdatedOptions::default());
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn prerequisite_within_slack_is_up_to_date() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let base = SystemTime::now();
        fx.set_mtime(&output, base);
        fx.set_mtime(&input, base + Duration::from_millis(500));

        let action = action_for(&fx, "out.bin", "in.src", "-o out.bin");
        let _ = fx.compute(vec![action.clone()], OutdatedOptions::default());
        let outdated = fx.compute(vec![action], OutdatedOptions::default());
        assert!(outdated.is_empty());
    }

    #[test]
    fn zero_length_object_output_counts_as_missing() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        fx.write("out.o", "");

        let outdated = fx.compute(
            vec![action_for(&fx, "out.o", "in.src", "-c in.src")],
            OutdatedOptions::default(),
        );
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn missing_dependency_list_is_outdated() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let base = SystemTime::now();
        fx.set_mtime(&input, base - Duration::from_secs(60));
        fx.set_mtime(&output, base);

        let mut action = action_for(&fx, "out.bin", "in.src", "-o out.bin");
        action.dependency_list_file = Some(fx.path("out.d"));
        let _ = fx.compute(vec![action.clone()], OutdatedOptions::default());
        let outdated = fx.compute(vec![action], OutdatedOptions::default());
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn malformed_dependency_list_is_a_cache_miss_not_an_abort() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let dep_file = fx.write("out.d", "no colon anywhere in this file\n");
        let base = SystemTime::now();
        fx.set_mtime(&input, base - Duration::from_secs(60));
        fx.set_mtime(&output, base);
        fx.set_mtime(&dep_file, base);

        let mut action = action_for(&fx, "out.bin", "in.src", "-o out.bin");
        action.dependency_list_file = Some(dep_file);

        // The parse failure is swallowed as a cache miss; the action is
        // simply outdated so the re-run can rewrite the file.
        let outdated = fx.compute(vec![action], OutdatedOptions::default());
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn discovered_header_newer_than_slack_is_outdated() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "binary");
        let header = fx.write("hdr.h", "header");
        let dep_file = fx.write(
            "out.d",
            &format!("out.bin: {}\n", header.display()),
        );
        let base = SystemTime::now();
        fx.set_mtime(&input, base - Duration::from_secs(60));
        fx.set_mtime(&output, base);
        fx.set_mtime(&dep_file, base);

        let mut action = action_for(&fx, "out.bin", "in.src", "-o out.bin");
        action.dependency_list_file = Some(dep_file.clone());

        // Header 2 seconds newer: outdated.
        fx.set_mtime(&header, base + Duration::from_secs(2));
        let _ = fx.compute(vec![action.clone()], OutdatedOptions::default());
        let outdated = fx.compute(vec![action.clone()], OutdatedOptions::default());
        assert_eq!(outdated, vec![0]);

        // Header half a second newer: within slack.
        fx.set_mtime(&header, base + Duration::from_millis(500));
        let outdated = fx.compute(vec![action], OutdatedOptions::default());
        assert!(outdated.is_empty());
    }

    #[test]
    fn outdatedness_propagates_to_dependents() {
        let fx = Fixture::new();
        fx.write("a.src", "source");
        // a.o is missing, so the compile is outdated; the link output exists
        // and is fresh but must still re-run.
        let app = fx.write("app", "binary");
        fx.set_mtime(&app, SystemTime::now());

        let compile = action_for(&fx, "a.o", "a.src", "-c a.src");
        let link_action = action_for(&fx, "app", "a.o", "-o app");
        let outdated = fx.compute(vec![compile, link_action], OutdatedOptions::default());
        assert_eq!(outdated, vec![0, 1]);
    }

    #[test]
    fn import_library_exception_suppresses_propagation() {
        let fx = Fixture::new();
        fx.write("core.c", "source");
        let implib = fx.write("core.lib", "imports");
        let app = fx.write("app", "binary");
        let base = SystemTime::now();
        fx.set_mtime(&implib, base);
        fx.set_mtime(&app, base);

        // The import-library producer is outdated (missing dll output keeps
        // it permanently stale in this fixture).
        let mut producer = test_action(
            &[
                fx.path("core.lib").to_str().unwrap(),
                fx.path("core.dll").to_str().unwrap(),
            ],
            &[fx.path("core.c").to_str().unwrap()],
            "-dll core.c",
        );
        producer.produces_import_library = true;

        let dependent = action_for(&fx, "app", "core.lib", "-o app");

        let outdated = fx.compute(
            vec![producer.clone(), dependent.clone()],
            OutdatedOptions::default(),
        );
        assert_eq!(outdated, vec![0, 1]);

        let outdated = fx.compute(
            vec![producer, dependent],
            OutdatedOptions {
                ignore_outdated_import_libraries: true,
            },
        );
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn prepare_outdated_deletes_outputs_and_creates_directories() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        let stale = fx.write("stale.bin", "old");
        let nested = fx.path("deep/dir/out.bin");

        let mut action = test_action(
            &[nested.to_str().unwrap()],
            &[fx.path("in.src").to_str().unwrap()],
            "-o out.bin",
        );
        action.delete_items = vec![stale.clone()];

        let graph = link(merge_action_sets(vec![("test".into(), vec![action])])).unwrap();
        let file_items = FileItemCache::new();
        let relinked = prepare_outdated(&graph, &[0], &file_items).unwrap();

        assert_eq!(relinked.len(), 1);
        assert!(!stale.exists());
        assert!(nested.parent().unwrap().is_dir());
    }
}
