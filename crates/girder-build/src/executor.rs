//! Action executors: the seam that runs the outdated subset.
//!
//! Executors are pluggable; the engine only requires that every action's
//! prerequisite-producing actions finish before it starts. The local executor
//! fans actions out across a bounded number of concurrent child processes
//! with fully-buffered per-action output.

use std::sync::Arc;

use async_trait::async_trait;

use girder_types::{GirderError, Result};

use crate::action::{Action, ActionType};
use crate::file_item::FileItemCache;
use crate::link::ActionGraph;

/// A strategy for executing a linked set of outdated actions.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this executor can run in the current environment. Probed
    /// during selection; unavailable executors are skipped.
    fn is_available(&self) -> bool;

    /// Run every action in `graph`, honouring prerequisite edges.
    ///
    /// Returns `Ok(false)` when one or more actions failed; `Err` is reserved
    /// for engine-level problems.
    async fn execute(&self, graph: &ActionGraph) -> Result<bool>;
}

/// Registry of executors probed in deterministic registration order.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn ActionExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing the executors girder ships with: just the local
    /// one. Distributed executors register ahead of it when compiled in.
    pub fn with_defaults(max_parallel_actions: usize) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalExecutor::new(max_parallel_actions)));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn ActionExecutor>) {
        self.executors.push(executor);
    }

    /// First available executor in registration order.
    pub fn select(&self) -> Option<Arc<dyn ActionExecutor>> {
        self.executors.iter().find(|e| e.is_available()).cloned()
    }
}

/// Split a command-argument string into argv entries, honouring double
/// quotes.
pub fn split_command_arguments(arguments: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in arguments.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Actions ordered by descending transitive-dependent count, so the
/// most-depended-on work starts first. The sort is stable, so ties keep
/// their linked order.
pub fn execution_order(graph: &ActionGraph) -> Vec<usize> {
    let mut order: Vec<usize> = (0..graph.len()).collect();
    order.sort_by(|&a, &b| {
        graph.actions[b]
            .num_total_dependents
            .cmp(&graph.actions[a].num_total_dependents)
    });
    order
}

async fn run_action(action: Arc<Action>) -> Result<(i32, String)> {
    let args = split_command_arguments(&action.command_arguments);
    let output = tokio::process::Command::new(&action.command_path)
        .args(&args)
        .current_dir(&action.working_directory)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.stderr.is_empty() {
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
    }
    Ok((output.status.code().unwrap_or(-1), combined))
}

/// Runs actions as local child processes, at most `max_parallel_actions` at
/// a time.
pub struct LocalExecutor {
    max_parallel_actions: usize,
}

impl LocalExecutor {
    pub fn new(max_parallel_actions: usize) -> Self {
        Self {
            max_parallel_actions: max_parallel_actions.max(1),
        }
    }
}

#[async_trait]
impl ActionExecutor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, graph: &ActionGraph) -> Result<bool> {
        let order = execution_order(graph);
        let mut started = vec![false; graph.len()];
        let mut completed = vec![false; graph.len()];
        let mut failures: Vec<String> = Vec::new();
        let mut stopping = false;

        let mut running = tokio::task::JoinSet::new();
        let mut running_count = 0usize;

        loop {
            if !stopping {
                while running_count < self.max_parallel_actions {
                    let ready = order.iter().copied().find(|&i| {
                        !started[i]
                            && graph.actions[i]
                                .prerequisite_actions
                                .iter()
                                .all(|&p| completed[p])
                    });
                    let Some(i) = ready else { break };
                    started[i] = true;
                    running_count += 1;
                    let action = graph.actions[i].action.clone();
                    tracing::info!(action = %action.describe(), "running action");
                    running.spawn(async move {
                        let result = run_action(action).await;
                        (i, result)
                    });
                }
            }

            if running_count == 0 {
                break;
            }

            let joined = running
                .join_next()
                .await
                .expect("running_count tracked a task");
            running_count -= 1;
            let (i, result) =
                joined.map_err(|e| GirderError::Other(format!("executor task failed: {e}")))?;
            let action = &graph.actions[i].action;
            match result {
                Ok((exit_code, output)) => {
                    // Output is buffered per action so interleaved diagnostics
                    // stay readable.
                    for line in output.lines() {
                        tracing::info!(action = %action.describe(), "{line}");
                    }
                    if exit_code == 0 {
                        completed[i] = true;
                    } else {
                        failures.push(format!(
                            "{} exited with code {exit_code}",
                            action.describe()
                        ));
                        stopping = true;
                    }
                }
                Err(e) => {
                    failures.push(format!("{} failed to start: {e}", action.describe()));
                    stopping = true;
                }
            }
        }

        for failure in &failures {
            tracing::error!("{failure}");
        }
        Ok(failures.is_empty())
    }
}

/// Post-execution sweep: invalidate the cached metadata of every produced
/// item and verify that link actions actually produced their declared
/// outputs.
pub fn finalize_execution(graph: &ActionGraph, file_items: &FileItemCache) -> Result<()> {
    for linked in &graph.actions {
        for item in &linked.action.produced_items {
            file_items.item(item).reset_info();
        }
    }
    for linked in &graph.actions {
        if linked.action.action_type != ActionType::Link {
            continue;
        }
        let missing: Vec<_> = linked
            .action
            .produced_items
            .iter()
            .filter(|item| !file_items.item(item).exists())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(GirderError::MissingOutputs {
                description: linked.action.describe(),
                items: missing,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{test_action, Action};
    use crate::link::{link, merge_action_sets};
    use std::path::{Path, PathBuf};

    fn shell_action(work_dir: &Path, produced: &[&str], prerequisites: &[&str], script: &str) -> Action {
        let mut action = test_action(produced, prerequisites, "");
        action.working_directory = work_dir.to_path_buf();
        action.command_path = PathBuf::from("/bin/sh");
        action.command_arguments = format!("-c \"{script}\"");
        action
    }

    fn linked(actions: Vec<Action>) -> ActionGraph {
        link(merge_action_sets(vec![("test".into(), actions)])).unwrap()
    }

    #[test]
    fn split_plain_arguments() {
        assert_eq!(
            split_command_arguments("-c a.c -o a.o"),
            vec!["-c", "a.c", "-o", "a.o"]
        );
    }

    #[test]
    fn split_quoted_arguments() {
        assert_eq!(
            split_command_arguments(r#"-c "touch out && echo done" -v"#),
            vec!["-c", "touch out && echo done", "-v"]
        );
    }

    #[test]
    fn split_empty_arguments() {
        assert!(split_command_arguments("   ").is_empty());
    }

    #[test]
    fn execution_order_prefers_most_depended_on() {
        let graph = linked(vec![
            test_action(&["/out/app"], &["/out/lib.a"], "link"),
            test_action(&["/out/lib.a"], &["/out/a.o"], "ar"),
            test_action(&["/out/a.o"], &["/src/a.c"], "compile"),
        ]);
        let order = execution_order(&graph);
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn local_executor_runs_actions_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");

        let produce_a = shell_action(
            dir.path(),
            &[a.to_str().unwrap()],
            &[],
            "printf first > a.txt",
        );
        let produce_b = shell_action(
            dir.path(),
            &[b.to_str().unwrap()],
            &[a.to_str().unwrap()],
            "cp a.txt b.txt",
        );

        let graph = linked(vec![produce_b, produce_a]);
        let executor = LocalExecutor::new(4);
        assert!(executor.execute(&graph).await.unwrap());
        assert_eq!(std::fs::read_to_string(&b).unwrap(), "first");
    }

    #[tokio::test]
    async fn local_executor_stops_launching_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");

        let failing = shell_action(dir.path(), &[a.to_str().unwrap()], &[], "exit 3");
        let dependent = shell_action(
            dir.path(),
            &[b.to_str().unwrap()],
            &[a.to_str().unwrap()],
            "touch b.txt",
        );

        let graph = linked(vec![failing, dependent]);
        let executor = LocalExecutor::new(4);
        assert!(!executor.execute(&graph).await.unwrap());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn local_executor_reports_all_in_flight_failures() {
        let dir = tempfile::tempdir().unwrap();
        let fail_a = shell_action(dir.path(), &["/out/a"], &[], "exit 1");
        let fail_b = shell_action(dir.path(), &["/out/b"], &[], "exit 2");

        let graph = linked(vec![fail_a, fail_b]);
        let executor = LocalExecutor::new(2);
        assert!(!executor.execute(&graph).await.unwrap());
    }

    #[test]
    fn registry_selects_first_available() {
        struct Unavailable;
        #[async_trait]
        impl ActionExecutor for Unavailable {
            fn name(&self) -> &str {
                "grid"
            }
            fn is_available(&self) -> bool {
                false
            }
            async fn execute(&self, _graph: &ActionGraph) -> Result<bool> {
                unreachable!("unavailable executor must not be selected")
            }
        }

        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Unavailable));
        registry.register(Arc::new(LocalExecutor::new(2)));
        assert_eq!(registry.select().unwrap().name(), "local");
    }

    #[test]
    fn finalize_flags_link_actions_with_missing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.so");
        std::fs::write(&present, "lib").unwrap();
        let absent = dir.path().join("absent.so");

        let mut action = test_action(
            &[present.to_str().unwrap(), absent.to_str().unwrap()],
            &[],
            "link",
        );
        action.action_type = ActionType::Link;
        let graph = linked(vec![action]);

        let file_items = FileItemCache::new();
        let err = finalize_execution(&graph, &file_items).unwrap_err();
        match err {
            GirderError::MissingOutputs { items, .. } => {
                assert_eq!(items, vec![absent]);
            }
            other => panic!("expected MissingOutputs, got {other:?}"),
        }
    }
}
