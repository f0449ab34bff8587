//! Action graph wiring: merging target action sets, producer resolution,
//! cycle detection, conflict detection, and path-length checks.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use girder_types::{GirderError, Result};

use crate::action::{Action, LinkedAction};

/// Hard ceiling on absolute path length, matching the portability limit of
/// the least capable supported filesystem layer.
pub const MAX_PATH_LENGTH: usize = 260;

/// A fully linked, acyclic action graph.
#[derive(Debug)]
pub struct ActionGraph {
    pub actions: Vec<LinkedAction>,
    /// Indices of `actions` in dependency-first order.
    pub topo_order: Vec<usize>,
    producer: HashMap<PathBuf, usize>,
}

impl ActionGraph {
    /// Index of the action producing `item`, if any action in the graph does.
    pub fn producer_of(&self, item: &Path) -> Option<usize> {
        self.producer.get(item).copied()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge per-target action sets into one list, deduplicating identical
/// actions and attaching every contributing target's group label.
pub fn merge_action_sets(
    sets: Vec<(String, Vec<Action>)>,
) -> Vec<(Arc<Action>, BTreeSet<String>)> {
    let mut index: HashMap<Action, usize> = HashMap::new();
    let mut merged: Vec<(Arc<Action>, BTreeSet<String>)> = Vec::new();

    for (group, actions) in sets {
        for action in actions {
            match index.get(&action) {
                Some(&i) => {
                    merged[i].1.insert(group.clone());
                }
                None => {
                    index.insert(action.clone(), merged.len());
                    let mut groups = BTreeSet::new();
                    groups.insert(group.clone());
                    merged.push((Arc::new(action), groups));
                }
            }
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// Conflict detection
// ---------------------------------------------------------------------------

/// Which fields differed between two actions producing the same item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictFields {
    pub action_type: bool,
    pub prerequisite_items: bool,
    pub delete_items: bool,
    pub dependency_list_file: bool,
    pub working_directory: bool,
    pub command_path: bool,
    pub command_arguments: bool,
}

impl ConflictFields {
    fn compare(a: &Action, b: &Action) -> Self {
        Self {
            action_type: a.action_type != b.action_type,
            prerequisite_items: a.prerequisite_items != b.prerequisite_items,
            delete_items: a.delete_items != b.delete_items,
            dependency_list_file: a.dependency_list_file != b.dependency_list_file,
            working_directory: a.working_directory != b.working_directory,
            command_path: a.command_path != b.command_path,
            command_arguments: a.command_arguments != b.command_arguments,
        }
    }

    pub fn any(&self) -> bool {
        self.bits() != 0
    }

    /// Stable bitmask of the differing fields, one bit per field in
    /// declaration order.
    pub fn bits(&self) -> u32 {
        let flags = [
            self.action_type,
            self.prerequisite_items,
            self.delete_items,
            self.dependency_list_file,
            self.working_directory,
            self.command_path,
            self.command_arguments,
        ];
        flags
            .iter()
            .enumerate()
            .fold(0, |acc, (i, &set)| acc | ((set as u32) << i))
    }
}

impl std::fmt::Display for ConflictFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.action_type, "action_type"),
            (self.prerequisite_items, "prerequisite_items"),
            (self.delete_items, "delete_items"),
            (self.dependency_list_file, "dependency_list_file"),
            (self.working_directory, "working_directory"),
            (self.command_path, "command_path"),
            (self.command_arguments, "command_arguments"),
        ];
        let listed: Vec<&str> = names.iter().filter(|(set, _)| *set).map(|(_, n)| *n).collect();
        f.write_str(&listed.join(", "))
    }
}

/// Verify that no item is produced by two non-equivalent actions.
///
/// Two actions colliding on an output are equivalent (legal duplication) iff
/// their type, prerequisites, delete items, dependency list file, working
/// directory, command path, and command arguments all match exactly. Any
/// other collision fails the build with the differing fields and a JSON dump
/// of both offenders.
pub fn check_for_conflicts(actions: &[(Arc<Action>, BTreeSet<String>)]) -> Result<()> {
    let mut first_producer: HashMap<&Path, &Arc<Action>> = HashMap::new();
    for (action, _) in actions {
        for item in &action.produced_items {
            match first_producer.get(item.as_path()) {
                None => {
                    first_producer.insert(item.as_path(), action);
                }
                Some(existing) => {
                    let fields = ConflictFields::compare(existing.as_ref(), action.as_ref());
                    if fields.any() {
                        let dump = serde_json::to_string_pretty(&serde_json::json!({
                            "First": existing.as_ref(),
                            "Second": action.as_ref(),
                        }))?;
                        return Err(GirderError::DuplicateProducer {
                            item: item.display().to_string(),
                            fields: fields.to_string(),
                            dump,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Path length checks
// ---------------------------------------------------------------------------

/// Warn on produced items nested too deeply under the engine root and fail
/// on any path at or beyond the absolute limit.
pub fn check_path_lengths(
    actions: &[(Arc<Action>, BTreeSet<String>)],
    engine_root: &Path,
    nested_length_limit: usize,
) -> Result<Vec<String>> {
    let mut warnings = Vec::new();
    for (action, _) in actions {
        for item in &action.produced_items {
            if let Ok(relative) = item.strip_prefix(engine_root) {
                let length = relative.as_os_str().len();
                if length > nested_length_limit {
                    warnings.push(format!(
                        "output {} is {} characters below the engine root, limit is {}",
                        item.display(),
                        length,
                        nested_length_limit
                    ));
                }
            }
        }
        for item in action.prerequisite_items.iter().chain(&action.produced_items) {
            let length = item.as_os_str().len();
            if length >= MAX_PATH_LENGTH {
                return Err(GirderError::PathTooLong {
                    path: item.display().to_string(),
                    length,
                    limit: MAX_PATH_LENGTH,
                });
            }
        }
    }
    Ok(warnings)
}

// ---------------------------------------------------------------------------
// Linking
// ---------------------------------------------------------------------------

/// Wire a merged action set into an [`ActionGraph`].
///
/// Resolves each prerequisite item to its producing action, rejects cycles
/// with a diagnostic enumerating every cyclic action, and computes the
/// transitive-dependent count used to order execution.
pub fn link(merged: Vec<(Arc<Action>, BTreeSet<String>)>) -> Result<ActionGraph> {
    let mut producer: HashMap<PathBuf, usize> = HashMap::new();
    for (i, (action, _)) in merged.iter().enumerate() {
        for item in &action.produced_items {
            producer.entry(item.clone()).or_insert(i);
        }
    }

    // Resolve prerequisite items to prerequisite actions.
    let mut prerequisite_actions: Vec<Vec<usize>> = Vec::with_capacity(merged.len());
    for (i, (action, _)) in merged.iter().enumerate() {
        let mut deps: Vec<usize> = action
            .prerequisite_items
            .iter()
            .filter_map(|item| producer.get(item).copied())
            .filter(|&j| j != i)
            .collect();
        deps.sort_unstable();
        deps.dedup();
        prerequisite_actions.push(deps);
    }

    // Iterative cycle detection: grow the set of actions whose producing
    // prerequisites are all settled. A fixpoint short of the full set means
    // the remainder participates in one or more cycles.
    let mut done = vec![false; merged.len()];
    let mut topo_order = Vec::with_capacity(merged.len());
    loop {
        let mut advanced = false;
        for i in 0..merged.len() {
            if !done[i] && prerequisite_actions[i].iter().all(|&j| done[j]) {
                done[i] = true;
                topo_order.push(i);
                advanced = true;
            }
        }
        if topo_order.len() == merged.len() {
            break;
        }
        if !advanced {
            let mut lines = Vec::new();
            for i in 0..merged.len() {
                if done[i] {
                    continue;
                }
                let cyclic: Vec<String> = prerequisite_actions[i]
                    .iter()
                    .filter(|&&j| !done[j])
                    .map(|&j| format!("#{} ({})", j, merged[j].0.describe()))
                    .collect();
                lines.push(format!(
                    "  #{} ({}) depends on {}",
                    i,
                    merged[i].0.describe(),
                    cyclic.join(", ")
                ));
            }
            return Err(GirderError::CycleDetected {
                description: lines.join("\n"),
            });
        }
    }

    // Transitive-dependent counts via reverse reachability.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); merged.len()];
    for (i, deps) in prerequisite_actions.iter().enumerate() {
        for &j in deps {
            dependents[j].push(i);
        }
    }
    let num_total_dependents: Vec<usize> = (0..merged.len())
        .map(|start| {
            let mut seen = HashSet::new();
            let mut queue: VecDeque<usize> = dependents[start].iter().copied().collect();
            while let Some(i) = queue.pop_front() {
                if seen.insert(i) {
                    queue.extend(dependents[i].iter().copied());
                }
            }
            seen.len()
        })
        .collect();

    let actions = merged
        .into_iter()
        .zip(prerequisite_actions)
        .zip(num_total_dependents)
        .map(|(((action, group_names), prereqs), count)| LinkedAction {
            action,
            prerequisite_actions: prereqs,
            num_total_dependents: count,
            group_names,
        })
        .collect();

    Ok(ActionGraph {
        actions,
        topo_order,
        producer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_action;

    fn merged(actions: Vec<Action>) -> Vec<(Arc<Action>, BTreeSet<String>)> {
        merge_action_sets(vec![("test".to_string(), actions)])
    }

    #[test]
    fn link_orders_dependencies_first() {
        let graph = link(merged(vec![
            test_action(&["/out/app"], &["/out/a.o", "/out/b.o"], "link"),
            test_action(&["/out/a.o"], &["/src/a.c"], "compile a"),
            test_action(&["/out/b.o"], &["/src/b.c"], "compile b"),
        ]))
        .unwrap();

        let pos: HashMap<usize, usize> = graph
            .topo_order
            .iter()
            .enumerate()
            .map(|(order, &i)| (i, order))
            .collect();
        for (i, linked) in graph.actions.iter().enumerate() {
            for &p in &linked.prerequisite_actions {
                assert!(pos[&p] < pos[&i], "producer {p} must precede {i}");
            }
        }
    }

    #[test]
    fn link_counts_transitive_dependents() {
        let graph = link(merged(vec![
            test_action(&["/out/a.o"], &["/src/a.c"], "compile"),
            test_action(&["/out/lib.a"], &["/out/a.o"], "ar"),
            test_action(&["/out/app"], &["/out/lib.a"], "link"),
        ]))
        .unwrap();

        assert_eq!(graph.actions[0].num_total_dependents, 2);
        assert_eq!(graph.actions[1].num_total_dependents, 1);
        assert_eq!(graph.actions[2].num_total_dependents, 0);
    }

    #[test]
    fn link_rejects_cycles_naming_all_participants() {
        let err = link(merged(vec![
            test_action(&["/out/a.o"], &["/out/b.o"], "make a"),
            test_action(&["/out/b.o"], &["/out/a.o"], "make b"),
        ]))
        .unwrap_err();

        match err {
            GirderError::CycleDetected { description } => {
                assert!(description.contains("#0"), "missing #0: {description}");
                assert!(description.contains("#1"), "missing #1: {description}");
                assert!(description.contains("make a"));
                assert!(description.contains("make b"));
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn link_tolerates_prerequisites_with_no_producer() {
        let graph = link(merged(vec![test_action(
            &["/out/a.o"],
            &["/src/a.c"],
            "compile",
        )]))
        .unwrap();
        assert!(graph.actions[0].prerequisite_actions.is_empty());
        assert_eq!(graph.producer_of(Path::new("/out/a.o")), Some(0));
        assert_eq!(graph.producer_of(Path::new("/src/a.c")), None);
    }

    #[test]
    fn merge_deduplicates_identical_actions_and_joins_groups() {
        let action = test_action(&["/out/shared.o"], &["/src/shared.c"], "compile");
        let merged = merge_action_sets(vec![
            ("Editor".to_string(), vec![action.clone()]),
            ("Game".to_string(), vec![action]),
        ]);
        assert_eq!(merged.len(), 1);
        let groups: Vec<&str> = merged[0].1.iter().map(String::as_str).collect();
        assert_eq!(groups, vec!["Editor", "Game"]);
    }

    #[test]
    fn conflicts_report_differing_fields() {
        let a = test_action(&["/out/x.o"], &["/src/x.c"], "compile -O0");
        let b = test_action(&["/out/x.o"], &["/src/x.c"], "compile -O3");
        let err = check_for_conflicts(&merged(vec![a, b])).unwrap_err();
        match err {
            GirderError::DuplicateProducer { item, fields, dump } => {
                assert_eq!(item, "/out/x.o");
                assert_eq!(fields, "command_arguments");
                assert!(dump.contains("-O0") && dump.contains("-O3"));
            }
            other => panic!("expected DuplicateProducer, got {other:?}"),
        }
    }

    #[test]
    fn equivalent_duplicates_are_legal() {
        // Same seven identity fields; differing command_version does not
        // constitute a conflict.
        let a = test_action(&["/out/x.o"], &["/src/x.c"], "compile");
        let mut b = a.clone();
        b.command_version = "9".to_string();
        assert!(check_for_conflicts(&merged(vec![a, b])).is_ok());
    }

    #[test]
    fn conflict_bits_are_stable() {
        let fields = ConflictFields {
            action_type: true,
            command_arguments: true,
            ..Default::default()
        };
        assert_eq!(fields.bits(), 0b100_0001);
        assert!(fields.any());
        assert!(!ConflictFields::default().any());
    }

    #[test]
    fn path_length_hard_limit() {
        let long = format!("/out/{}", "x".repeat(300));
        let err =
            check_path_lengths(&merged(vec![test_action(&[&long], &[], "c")]), Path::new("/e"), 96)
                .unwrap_err();
        assert!(matches!(err, GirderError::PathTooLong { .. }));
    }

    #[test]
    fn path_length_nested_warning() {
        let nested = format!("/engine/{}", "d/".repeat(60));
        let warnings = check_path_lengths(
            &merged(vec![test_action(&[&nested], &[], "c")]),
            Path::new("/engine"),
            96,
        )
        .unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("below the engine root"));
    }
}
