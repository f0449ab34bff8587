//! The action model: one external process invocation with declared inputs and
//! outputs, as handed to the engine by a toolchain adapter.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// The kind of work an action performs. Behaviour differences (such as the
/// zero-length object-file exception or the link output check) key off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Compile,
    CompileModuleInterface,
    GatherModuleDependencies,
    Link,
    WriteMetadata,
    BuildProject,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::Compile => "Compile",
            ActionType::CompileModuleInterface => "CompileModuleInterface",
            ActionType::GatherModuleDependencies => "GatherModuleDependencies",
            ActionType::Link => "Link",
            ActionType::WriteMetadata => "WriteMetadata",
            ActionType::BuildProject => "BuildProject",
        };
        f.write_str(name)
    }
}

/// A single external process invocation with declared prerequisites and
/// produced files. Immutable once handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    pub action_type: ActionType,
    pub working_directory: PathBuf,
    pub command_path: PathBuf,
    pub command_arguments: String,
    /// Opaque tool version; changes when the tool's semantics change, so that
    /// history invalidates even when the command line is identical.
    pub command_version: String,
    pub prerequisite_items: Vec<PathBuf>,
    pub produced_items: Vec<PathBuf>,
    /// Items removed from disk before the action re-runs.
    pub delete_items: Vec<PathBuf>,
    /// Optional compiler-emitted file listing additional discovered
    /// prerequisites (`.d`, `.txt`, `.json`).
    pub dependency_list_file: Option<PathBuf>,
    pub produces_import_library: bool,
    pub use_action_history: bool,
    pub status_description: String,
}

impl Action {
    /// The fingerprint recorded in the action history for every produced item.
    pub fn producing_attributes(&self) -> String {
        format!(
            "{} {} (ver {})",
            self.command_path.display(),
            self.command_arguments,
            self.command_version
        )
    }

    /// Short human-readable identity used in diagnostics.
    pub fn describe(&self) -> String {
        if self.status_description.is_empty() {
            format!("{} {}", self.command_path.display(), self.command_arguments)
        } else {
            self.status_description.clone()
        }
    }

    pub fn produces(&self, item: &Path) -> bool {
        self.produced_items.iter().any(|p| p == item)
    }
}

/// An action wired into a graph: its producer edges resolved to other
/// actions, its transitive-dependent count computed for scheduling, and the
/// labels of every target group that contributed it.
#[derive(Debug, Clone)]
pub struct LinkedAction {
    pub action: Arc<Action>,
    /// Indices (into the owning graph) of the actions producing this
    /// action's prerequisite items.
    pub prerequisite_actions: Vec<usize>,
    /// How many actions transitively depend on this one. Higher counts are
    /// scheduled first.
    pub num_total_dependents: usize,
    pub group_names: BTreeSet<String>,
}

#[cfg(test)]
pub(crate) fn test_action(
    produced: &[&str],
    prerequisites: &[&str],
    arguments: &str,
) -> Action {
    Action {
        action_type: ActionType::Compile,
        working_directory: PathBuf::from("/work"),
        command_path: PathBuf::from("/usr/bin/tool"),
        command_arguments: arguments.to_string(),
        command_version: "1".to_string(),
        prerequisite_items: prerequisites.iter().map(PathBuf::from).collect(),
        produced_items: produced.iter().map(PathBuf::from).collect(),
        delete_items: Vec::new(),
        dependency_list_file: None,
        produces_import_library: false,
        use_action_history: true,
        status_description: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producing_attributes_format() {
        let action = test_action(&["/out/a.o"], &["/src/a.c"], "-c a.c -o a.o");
        assert_eq!(
            action.producing_attributes(),
            "/usr/bin/tool -c a.c -o a.o (ver 1)"
        );
    }

    #[test]
    fn producing_attributes_change_with_version() {
        let mut action = test_action(&["/out/a.o"], &["/src/a.c"], "-c a.c");
        let before = action.producing_attributes();
        action.command_version = "2".to_string();
        assert_ne!(before, action.producing_attributes());
    }

    #[test]
    fn describe_prefers_status_description() {
        let mut action = test_action(&["/out/a.o"], &[], "-c");
        assert_eq!(action.describe(), "/usr/bin/tool -c");
        action.status_description = "a.c".to_string();
        assert_eq!(action.describe(), "a.c");
    }

    #[test]
    fn action_serde_round_trip() {
        let action = test_action(&["/out/a.o"], &["/src/a.c"], "-c a.c");
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, action);
    }
}
