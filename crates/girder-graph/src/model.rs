//! The build graph model: agents, nodes, tasks, triggers, and reports.
//!
//! The script reader is an external collaborator; it hands the runtime this
//! parsed graph value as a JSON document. The model validates structure
//! (unique names, resolvable tags) before anything runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use girder_types::{GirderError, Result, ScriptLocation};

/// A parsed-but-unbound task from the script: name, raw string arguments,
/// and where it was declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub location: Option<ScriptLocation>,
}

/// An ordered sequence of tasks with declared tag inputs and outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Tags consumed from other nodes, e.g. `#compiled`.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Tags this node publishes. The default tag `#<name>` is always
    /// present after normalization.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskInfo>,
    /// Token files that must be exclusively held before this node runs.
    #[serde(default)]
    pub required_tokens: Vec<PathBuf>,
}

impl Node {
    /// The implicit tag carrying any output file not explicitly tagged.
    pub fn default_output_tag(&self) -> String {
        format!("#{}", self.name)
    }
}

/// A group of nodes intended to run together on one machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub agent_types: Vec<String>,
    /// When set, the agent's nodes only run if this trigger is activated.
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// A guarded grouping that executes only when named on the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
}

/// A passive aggregation of node outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// The whole parsed script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub reports: Vec<Report>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Default values for the standard script properties every job sees.
pub fn standard_properties(root_dir: &Path) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    properties.insert("Branch".to_string(), "Unknown".to_string());
    properties.insert("Depot".to_string(), "Unknown".to_string());
    properties.insert("EscapedBranch".to_string(), "Unknown".to_string());
    properties.insert("Change".to_string(), "0".to_string());
    properties.insert("CodeChange".to_string(), "0".to_string());
    properties.insert("IsBuildMachine".to_string(), "false".to_string());
    properties.insert("HostPlatform".to_string(), std::env::consts::OS.to_string());
    properties.insert(
        "RootDir".to_string(),
        root_dir.to_string_lossy().into_owned(),
    );
    properties.insert("EngineMajorVersion".to_string(), "1".to_string());
    properties.insert("EngineMinorVersion".to_string(), "0".to_string());
    properties.insert("EnginePatchVersion".to_string(), "0".to_string());
    properties
}

impl Graph {
    /// Parse a graph from its JSON form and validate it.
    pub fn from_json(text: &str) -> Result<Graph> {
        let mut graph: Graph = serde_json::from_str(text)?;
        graph.normalize();
        graph.validate()?;
        Ok(graph)
    }

    pub fn load(path: &Path) -> Result<Graph> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Ensure every node declares its default output tag.
    fn normalize(&mut self) {
        for agent in &mut self.agents {
            for node in &mut agent.nodes {
                let default_tag = node.default_output_tag();
                if !node.outputs.contains(&default_tag) {
                    node.outputs.insert(0, default_tag);
                }
            }
        }
    }

    /// Structural validation: unique node names, globally unique output
    /// tags, resolvable inputs, known trigger and report references.
    fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        let mut node_names: HashMap<&str, ()> = HashMap::new();
        let mut tag_owners: HashMap<&str, &str> = HashMap::new();
        for agent in &self.agents {
            if let Some(trigger) = &agent.trigger {
                if !self.triggers.iter().any(|t| &t.name == trigger) {
                    problems.push(format!(
                        "agent '{}' references unknown trigger '{trigger}'",
                        agent.name
                    ));
                }
            }
            for node in &agent.nodes {
                if node_names.insert(&node.name, ()).is_some() {
                    problems.push(format!("node '{}' is declared twice", node.name));
                }
                for output in &node.outputs {
                    if !output.starts_with('#') {
                        problems.push(format!(
                            "node '{}' declares output '{output}' without a leading '#'",
                            node.name
                        ));
                    } else if let Some(owner) = tag_owners.insert(output, &node.name) {
                        problems.push(format!(
                            "tag '{output}' is declared by both '{owner}' and '{}'",
                            node.name
                        ));
                    }
                }
            }
        }

        for agent in &self.agents {
            for node in &agent.nodes {
                for input in &node.inputs {
                    if !tag_owners.contains_key(input.as_str()) {
                        problems.push(format!(
                            "node '{}' consumes tag '{input}' which no node produces",
                            node.name
                        ));
                    }
                }
            }
        }

        for report in &self.reports {
            for name in &report.nodes {
                if !node_names.contains_key(name.as_str()) {
                    problems.push(format!(
                        "report '{}' references unknown node '{name}'",
                        report.name
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GirderError::InvalidArgument(problems.join("; ")))
        }
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.agents
            .iter()
            .flat_map(|a| a.nodes.iter())
            .find(|n| n.name == name)
    }

    /// The agent owning `node`.
    pub fn agent_of(&self, node: &str) -> Option<&Agent> {
        self.agents
            .iter()
            .find(|a| a.nodes.iter().any(|n| n.name == node))
    }

    /// All nodes in declaration order (agents in order, nodes within each
    /// agent in order). This is the single-driver execution order.
    pub fn nodes_in_order(&self) -> impl Iterator<Item = &Node> {
        self.agents.iter().flat_map(|a| a.nodes.iter())
    }

    /// The node producing `tag`, resolved through the global tag map.
    pub fn producer_of_tag(&self, tag: &str) -> Option<&Node> {
        self.nodes_in_order()
            .find(|n| n.outputs.iter().any(|o| o == tag))
    }

    /// Resolve a target name to node names: a node matches itself, an agent
    /// matches all its nodes. Unknown targets are fatal.
    pub fn resolve_target(&self, target: &str) -> Result<Vec<String>> {
        if let Some(node) = self.node(target) {
            return Ok(vec![node.name.clone()]);
        }
        if let Some(agent) = self.agents.iter().find(|a| a.name == target) {
            return Ok(agent.nodes.iter().map(|n| n.name.clone()).collect());
        }
        Err(GirderError::UnknownTarget {
            target: target.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> Graph {
        Graph::from_json(
            r##"{
                "agents": [
                    {
                        "name": "Compile Agent",
                        "nodes": [
                            {
                                "name": "Compile",
                                "outputs": ["#binaries"],
                                "tasks": [{"name": "command", "arguments": {"command": "cc"}}]
                            },
                            {
                                "name": "Package",
                                "inputs": ["#binaries"]
                            }
                        ]
                    }
                ]
            }"##,
        )
        .unwrap()
    }

    #[test]
    fn normalization_adds_default_output_tags() {
        let graph = two_node_graph();
        let compile = graph.node("Compile").unwrap();
        assert!(compile.outputs.contains(&"#Compile".to_string()));
        assert!(compile.outputs.contains(&"#binaries".to_string()));
    }

    #[test]
    fn producer_of_tag_resolves_globally() {
        let graph = two_node_graph();
        assert_eq!(graph.producer_of_tag("#binaries").unwrap().name, "Compile");
        assert_eq!(graph.producer_of_tag("#Package").unwrap().name, "Package");
        assert!(graph.producer_of_tag("#nothing").is_none());
    }

    #[test]
    fn resolve_target_by_node_and_agent() {
        let graph = two_node_graph();
        assert_eq!(graph.resolve_target("Package").unwrap(), vec!["Package"]);
        assert_eq!(
            graph.resolve_target("Compile Agent").unwrap(),
            vec!["Compile", "Package"]
        );
        assert!(matches!(
            graph.resolve_target("Nope"),
            Err(GirderError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn duplicate_node_names_rejected() {
        let result = Graph::from_json(
            r#"{"agents": [{"name": "A", "nodes": [{"name": "X"}, {"name": "X"}]}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_output_tags_rejected() {
        let result = Graph::from_json(
            r##"{"agents": [{"name": "A", "nodes": [
                {"name": "X", "outputs": ["#shared"]},
                {"name": "Y", "outputs": ["#shared"]}
            ]}]}"##,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unresolvable_input_rejected() {
        let result = Graph::from_json(
            r##"{"agents": [{"name": "A", "nodes": [{"name": "X", "inputs": ["#ghost"]}]}]}"##,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_trigger_reference_rejected() {
        let result = Graph::from_json(
            r#"{"agents": [{"name": "A", "trigger": "Nightly", "nodes": [{"name": "X"}]}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn known_trigger_reference_accepted() {
        let graph = Graph::from_json(
            r#"{
                "triggers": [{"name": "Nightly"}],
                "agents": [{"name": "A", "trigger": "Nightly", "nodes": [{"name": "X"}]}]
            }"#,
        )
        .unwrap();
        assert_eq!(graph.agent_of("X").unwrap().trigger.as_deref(), Some("Nightly"));
    }

    #[test]
    fn standard_properties_cover_the_published_set() {
        let properties = standard_properties(Path::new("/work"));
        for key in [
            "Branch",
            "Depot",
            "EscapedBranch",
            "Change",
            "CodeChange",
            "IsBuildMachine",
            "HostPlatform",
            "RootDir",
            "EngineMajorVersion",
            "EngineMinorVersion",
            "EnginePatchVersion",
        ] {
            assert!(properties.contains_key(key), "missing {key}");
        }
        assert_eq!(properties["RootDir"], "/work");
    }
}
