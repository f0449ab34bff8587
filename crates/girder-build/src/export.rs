//! JSON export of a linked action graph, consumed by external build
//! distribution frontends.

use std::collections::BTreeMap;
use std::path::Path;

use girder_types::Result;

use crate::link::ActionGraph;

/// Render the graph as the exchange document:
/// `{ "Environment": {...}, "Actions": [...] }`.
pub fn export_action_graph(
    graph: &ActionGraph,
    environment: &BTreeMap<String, String>,
) -> serde_json::Value {
    let actions: Vec<serde_json::Value> = graph
        .actions
        .iter()
        .enumerate()
        .map(|(id, linked)| {
            let action = &linked.action;
            let mut entry = serde_json::json!({
                "id": id,
                "action_type": action.action_type,
                "command_path": action.command_path,
                "command_arguments": action.command_arguments,
                "working_directory": action.working_directory,
                "prerequisite_items": action.prerequisite_items,
                "produced_items": action.produced_items,
                "group_names": linked.group_names,
            });
            let object = entry.as_object_mut().expect("entry is an object");
            if let Some(dep_file) = &action.dependency_list_file {
                object.insert(
                    "dependency_list_file".to_string(),
                    serde_json::json!(dep_file),
                );
            }
            if action.produces_import_library {
                object.insert("produces_import_library".to_string(), serde_json::json!(true));
            }
            entry
        })
        .collect();

    serde_json::json!({
        "Environment": environment,
        "Actions": actions,
    })
}

/// Export the graph to a file, pretty-printed.
pub fn write_action_graph(
    path: &Path,
    graph: &ActionGraph,
    environment: &BTreeMap<String, String>,
) -> Result<()> {
    let document = export_action_graph(graph, environment);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&document)?)?;
    Ok(())
}
