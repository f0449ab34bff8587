//! Task binding: from parsed `TaskInfo` records to typed task instances.
//!
//! Every task class is declared by an explicit table of parameter
//! descriptors plus a constructor taking the typed values. The binder checks
//! required parameters, parses each argument string into its declared type,
//! and validates tag flow against the node's declared inputs and outputs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use girder_types::{GirderError, Result, ScriptLocation};

use crate::condition::evaluate_bool;
use crate::model::{Graph, Node, TaskInfo};
use crate::task::{CommandTask, CopyTask, DeleteTask, TagTask, Task};

/// The value type of a task parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Bool,
    Int,
    Enum(&'static [&'static str]),
    File,
    Directory,
}

/// Extra validation applied to the raw argument string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValidation {
    None,
    /// A single `#tag` reference.
    Tag,
    /// A `;`-separated list of `#tag` references.
    TagList,
    /// Quotes and brackets must balance.
    BalancedString,
}

/// Descriptor for one named task argument.
#[derive(Debug, Clone, Copy)]
pub struct TaskParameter {
    pub name: &'static str,
    pub value_type: ParamType,
    pub validation: ParamValidation,
    pub optional: bool,
    /// Collection parameters split their argument on `;` and parse each
    /// element.
    pub collection: bool,
}

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Bool(bool),
    Int(i64),
    Path(PathBuf),
    List(Vec<ParamValue>),
}

/// The typed parameter record handed to a task constructor.
#[derive(Debug, Clone, Default)]
pub struct BoundParameters {
    values: BTreeMap<String, ParamValue>,
}

impl BoundParameters {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.values.get(name) {
            Some(ParamValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParamValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_path(&self, name: &str) -> Option<PathBuf> {
        match self.values.get(name) {
            Some(ParamValue::Path(p)) => Some(p.clone()),
            _ => None,
        }
    }

    fn require_string(&self, task: &str, name: &str) -> Result<String> {
        self.get_string(name)
            .ok_or_else(|| GirderError::MissingParameter {
                task: task.to_string(),
                parameter: name.to_string(),
                location: None,
            })
    }
}

/// A task class: its name, parameter table, and constructor.
pub struct TaskBinding {
    pub name: &'static str,
    pub parameters: &'static [TaskParameter],
    pub construct: fn(&BoundParameters, Option<ScriptLocation>) -> Result<Box<dyn Task>>,
}

/// Registry of task bindings keyed by lowercase task name.
pub struct TaskRegistry {
    bindings: HashMap<String, TaskBinding>,
}

fn is_balanced(value: &str) -> bool {
    let mut quotes = 0usize;
    let mut depth: i64 = 0;
    for c in value.chars() {
        match c {
            '"' => quotes += 1,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    quotes % 2 == 0 && depth == 0
}

fn validate_raw(
    task: &str,
    parameter: &TaskParameter,
    value: &str,
    location: &Option<ScriptLocation>,
) -> Result<()> {
    let invalid = |reason: String| {
        GirderError::InvalidArgument(format!(
            "task '{task}' parameter '{}'{}: {reason}",
            parameter.name,
            location
                .as_ref()
                .map(|l| format!(" at {l}"))
                .unwrap_or_default()
        ))
    };
    match parameter.validation {
        ParamValidation::None => Ok(()),
        ParamValidation::Tag => {
            if value.starts_with('#') && !value.contains(';') {
                Ok(())
            } else {
                Err(invalid(format!("'{value}' is not a #tag reference")))
            }
        }
        ParamValidation::TagList => {
            if value.split(';').all(|t| t.trim().starts_with('#')) {
                Ok(())
            } else {
                Err(invalid(format!("'{value}' is not a list of #tag references")))
            }
        }
        ParamValidation::BalancedString => {
            if is_balanced(value) {
                Ok(())
            } else {
                Err(invalid(format!("'{value}' has unbalanced quoting")))
            }
        }
    }
}

fn parse_scalar(
    task: &str,
    parameter: &TaskParameter,
    value: &str,
    properties: &BTreeMap<String, String>,
    root: &Path,
) -> Result<ParamValue> {
    let invalid = |reason: String| {
        GirderError::InvalidArgument(format!(
            "task '{task}' parameter '{}': {reason}",
            parameter.name
        ))
    };
    match parameter.value_type {
        ParamType::String => Ok(ParamValue::String(value.to_string())),
        ParamType::Bool => Ok(ParamValue::Bool(evaluate_bool(value, properties)?)),
        ParamType::Int => value
            .trim()
            .parse::<i64>()
            .map(ParamValue::Int)
            .map_err(|_| invalid(format!("'{value}' is not an integer"))),
        ParamType::Enum(allowed) => {
            let matched = allowed
                .iter()
                .find(|candidate| candidate.eq_ignore_ascii_case(value.trim()));
            match matched {
                Some(name) => Ok(ParamValue::String((*name).to_string())),
                None => Err(invalid(format!(
                    "'{value}' is not one of {}",
                    allowed.join(", ")
                ))),
            }
        }
        ParamType::File | ParamType::Directory => {
            let path = Path::new(value.trim());
            let resolved = if path.is_absolute() {
                path.to_path_buf()
            } else {
                root.join(path)
            };
            Ok(ParamValue::Path(resolved))
        }
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in task set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(command_binding());
        registry.register(copy_binding());
        registry.register(delete_binding());
        registry.register(tag_binding());
        registry
    }

    pub fn register(&mut self, binding: TaskBinding) {
        self.bindings.insert(binding.name.to_lowercase(), binding);
    }

    pub fn has(&self, name: &str) -> bool {
        self.bindings.contains_key(&name.to_lowercase())
    }

    /// Bind one parsed task to an instance.
    pub fn bind(
        &self,
        info: &TaskInfo,
        properties: &BTreeMap<String, String>,
        root: &Path,
    ) -> Result<Box<dyn Task>> {
        let binding = self.bindings.get(&info.name.to_lowercase()).ok_or_else(|| {
            GirderError::UnknownTask {
                task: info.name.clone(),
                location: info.location.clone(),
            }
        })?;

        for parameter in binding.parameters {
            if !parameter.optional && !info.arguments.contains_key(parameter.name) {
                return Err(GirderError::MissingParameter {
                    task: info.name.clone(),
                    parameter: parameter.name.to_string(),
                    location: info.location.clone(),
                });
            }
        }

        let mut bound = BoundParameters::default();
        for (name, raw) in &info.arguments {
            let Some(parameter) = binding.parameters.iter().find(|p| p.name == name) else {
                tracing::warn!(
                    task = %info.name,
                    argument = %name,
                    "ignoring unknown task argument"
                );
                continue;
            };
            validate_raw(&info.name, parameter, raw, &info.location)?;
            let value = if parameter.collection {
                let elements = raw
                    .split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|element| parse_scalar(&info.name, parameter, element, properties, root))
                    .collect::<Result<Vec<_>>>()?;
                ParamValue::List(elements)
            } else {
                parse_scalar(&info.name, parameter, raw, properties, root)?
            };
            bound.values.insert(parameter.name.to_string(), value);
        }

        (binding.construct)(&bound, info.location.clone())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Bind every task of a node, validating tag flow along the way.
///
/// A consumed tag must be a node input, a node output, or a tag produced by
/// an earlier task of the same node. A produced tag must be a node output or
/// a local scratch tag no other node owns.
pub fn bind_node_tasks(
    registry: &TaskRegistry,
    node: &Node,
    graph: &Graph,
    properties: &BTreeMap<String, String>,
    root: &Path,
) -> Result<Vec<Box<dyn Task>>> {
    let mut available: BTreeSet<String> = node
        .inputs
        .iter()
        .chain(node.outputs.iter())
        .cloned()
        .collect();

    let mut tasks = Vec::with_capacity(node.tasks.len());
    for info in &node.tasks {
        let task = registry.bind(info, properties, root)?;

        for tag in task.consumed_tags() {
            if !available.contains(&tag) {
                return Err(GirderError::UnresolvedTag {
                    tag,
                    reason: format!(
                        "not an input of node '{}' and not produced by an earlier task",
                        node.name
                    ),
                    location: info.location.clone(),
                });
            }
        }
        for tag in task.produced_tags() {
            let foreign = graph
                .producer_of_tag(&tag)
                .map(|owner| owner.name != node.name)
                .unwrap_or(false);
            if foreign {
                return Err(GirderError::UnresolvedTag {
                    tag,
                    reason: format!("tag belongs to another node, not '{}'", node.name),
                    location: info.location.clone(),
                });
            }
            available.insert(tag);
        }

        tasks.push(task);
    }
    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Built-in bindings
// ---------------------------------------------------------------------------

fn command_binding() -> TaskBinding {
    const PARAMETERS: &[TaskParameter] = &[
        TaskParameter {
            name: "command",
            value_type: ParamType::String,
            validation: ParamValidation::None,
            optional: false,
            collection: false,
        },
        TaskParameter {
            name: "arguments",
            value_type: ParamType::String,
            validation: ParamValidation::BalancedString,
            optional: true,
            collection: false,
        },
        TaskParameter {
            name: "group",
            value_type: ParamType::String,
            validation: ParamValidation::None,
            optional: true,
            collection: false,
        },
    ];
    TaskBinding {
        name: "command",
        parameters: PARAMETERS,
        construct: |params, location| {
            Ok(Box::new(CommandTask {
                program: params.require_string("command", "command")?,
                arguments: params.get_string("arguments").unwrap_or_default(),
                group: params.get_string("group"),
                location,
            }))
        },
    }
}

fn copy_binding() -> TaskBinding {
    const PARAMETERS: &[TaskParameter] = &[
        TaskParameter {
            name: "files",
            value_type: ParamType::String,
            validation: ParamValidation::None,
            optional: false,
            collection: false,
        },
        TaskParameter {
            name: "to",
            value_type: ParamType::String,
            validation: ParamValidation::None,
            optional: false,
            collection: false,
        },
        TaskParameter {
            name: "tag",
            value_type: ParamType::String,
            validation: ParamValidation::Tag,
            optional: true,
            collection: false,
        },
    ];
    TaskBinding {
        name: "copy",
        parameters: PARAMETERS,
        construct: |params, location| {
            Ok(Box::new(CopyTask {
                files: params.require_string("copy", "files")?,
                to_dir: params.require_string("copy", "to")?,
                tag: params.get_string("tag"),
                location,
            }))
        },
    }
}

fn delete_binding() -> TaskBinding {
    const PARAMETERS: &[TaskParameter] = &[TaskParameter {
        name: "files",
        value_type: ParamType::String,
        validation: ParamValidation::None,
        optional: false,
        collection: false,
    }];
    TaskBinding {
        name: "delete",
        parameters: PARAMETERS,
        construct: |params, location| {
            Ok(Box::new(DeleteTask {
                files: params.require_string("delete", "files")?,
                location,
            }))
        },
    }
}

fn tag_binding() -> TaskBinding {
    const PARAMETERS: &[TaskParameter] = &[
        TaskParameter {
            name: "files",
            value_type: ParamType::String,
            validation: ParamValidation::None,
            optional: false,
            collection: false,
        },
        TaskParameter {
            name: "with",
            value_type: ParamType::String,
            validation: ParamValidation::Tag,
            optional: false,
            collection: false,
        },
    ];
    TaskBinding {
        name: "tag",
        parameters: PARAMETERS,
        construct: |params, location| {
            Ok(Box::new(TagTask {
                files: params.require_string("tag", "files")?,
                tag: params.require_string("tag", "with")?,
                location,
            }))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, args: &[(&str, &str)]) -> TaskInfo {
        TaskInfo {
            name: name.to_string(),
            arguments: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            location: Some(ScriptLocation::new("graph.json", 4)),
        }
    }

    fn props() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn unknown_task_name_is_fatal_with_location() {
        let registry = TaskRegistry::with_defaults();
        let err = registry
            .bind(&info("frobnicate", &[]), &props(), Path::new("/w"))
            .unwrap_err();
        match err {
            GirderError::UnknownTask { task, location } => {
                assert_eq!(task, "frobnicate");
                assert_eq!(location.unwrap().line, 4);
            }
            other => panic!("expected UnknownTask, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_parameter_is_fatal() {
        let registry = TaskRegistry::with_defaults();
        let err = registry
            .bind(&info("copy", &[("files", "a.txt")]), &props(), Path::new("/w"))
            .unwrap_err();
        assert!(matches!(
            err,
            GirderError::MissingParameter { ref parameter, .. } if parameter == "to"
        ));
    }

    #[test]
    fn command_binds_with_optional_arguments() {
        let registry = TaskRegistry::with_defaults();
        let task = registry
            .bind(
                &info("command", &[("command", "cc"), ("arguments", "-c a.c")]),
                &props(),
                Path::new("/w"),
            )
            .unwrap();
        assert_eq!(task.name(), "command");
    }

    #[test]
    fn task_names_bind_case_insensitively() {
        let registry = TaskRegistry::with_defaults();
        assert!(registry
            .bind(&info("Command", &[("command", "cc")]), &props(), Path::new("/w"))
            .is_ok());
    }

    #[test]
    fn tag_validation_rejects_non_tags() {
        let registry = TaskRegistry::with_defaults();
        let err = registry
            .bind(
                &info("tag", &[("files", "*.o"), ("with", "objects")]),
                &props(),
                Path::new("/w"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("not a #tag reference"));
    }

    #[test]
    fn balanced_string_validation() {
        let registry = TaskRegistry::with_defaults();
        let err = registry
            .bind(
                &info("command", &[("command", "cc"), ("arguments", "\"unclosed")]),
                &props(),
                Path::new("/w"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn bool_int_enum_and_file_parsing() {
        // Exercise the scalar parser through a custom binding.
        const PARAMETERS: &[TaskParameter] = &[
            TaskParameter {
                name: "enabled",
                value_type: ParamType::Bool,
                validation: ParamValidation::None,
                optional: true,
                collection: false,
            },
            TaskParameter {
                name: "level",
                value_type: ParamType::Int,
                validation: ParamValidation::None,
                optional: true,
                collection: false,
            },
            TaskParameter {
                name: "mode",
                value_type: ParamType::Enum(&["debug", "release"]),
                validation: ParamValidation::None,
                optional: true,
                collection: false,
            },
            TaskParameter {
                name: "script",
                value_type: ParamType::File,
                validation: ParamValidation::None,
                optional: true,
                collection: false,
            },
            TaskParameter {
                name: "sources",
                value_type: ParamType::File,
                validation: ParamValidation::None,
                optional: true,
                collection: true,
            },
        ];

        fn construct(
            params: &BoundParameters,
            _location: Option<ScriptLocation>,
        ) -> Result<Box<dyn Task>> {
            assert_eq!(params.get_bool("enabled"), Some(true));
            assert_eq!(params.get_int("level"), Some(3));
            assert_eq!(params.get_string("mode").as_deref(), Some("release"));
            assert_eq!(params.get_path("script"), Some(PathBuf::from("/w/run.sh")));
            match params.get("sources") {
                Some(ParamValue::List(items)) => assert_eq!(items.len(), 2),
                other => panic!("expected list, got {other:?}"),
            }
            Ok(Box::new(crate::task::DeleteTask {
                files: String::new(),
                location: None,
            }))
        }

        let mut registry = TaskRegistry::new();
        registry.register(TaskBinding {
            name: "probe",
            parameters: PARAMETERS,
            construct,
        });

        let mut properties = BTreeMap::new();
        properties.insert("IsBuildMachine".to_string(), "true".to_string());
        registry
            .bind(
                &info(
                    "probe",
                    &[
                        ("enabled", "IsBuildMachine=true"),
                        ("level", "3"),
                        ("mode", "Release"),
                        ("script", "run.sh"),
                        ("sources", "a.c;b.c"),
                    ],
                ),
                &properties,
                Path::new("/w"),
            )
            .unwrap();
    }

    // --- tag flow ---

    fn flow_graph() -> Graph {
        Graph::from_json(
            r##"{
                "agents": [{
                    "name": "A",
                    "nodes": [
                        {"name": "Producer", "outputs": ["#artifacts"]},
                        {
                            "name": "Consumer",
                            "inputs": ["#artifacts"],
                            "tasks": [
                                {"name": "tag", "arguments": {"files": "*.o", "with": "#scratch"}},
                                {"name": "copy", "arguments": {"files": "#scratch", "to": "staged"}}
                            ]
                        }
                    ]
                }]
            }"##,
        )
        .unwrap()
    }

    #[test]
    fn tag_flow_allows_inputs_and_earlier_local_tags() {
        let graph = flow_graph();
        let node = graph.node("Consumer").unwrap();
        let registry = TaskRegistry::with_defaults();
        let tasks =
            bind_node_tasks(&registry, node, &graph, &props(), Path::new("/w")).unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn tag_flow_rejects_unproduced_consumption() {
        let graph = Graph::from_json(
            r##"{
                "agents": [{
                    "name": "A",
                    "nodes": [{
                        "name": "Lonely",
                        "tasks": [
                            {"name": "copy", "arguments": {"files": "#ghost", "to": "out"}}
                        ]
                    }]
                }]
            }"##,
        )
        .unwrap();
        let node = graph.node("Lonely").unwrap();
        let registry = TaskRegistry::with_defaults();
        let err =
            bind_node_tasks(&registry, node, &graph, &props(), Path::new("/w")).unwrap_err();
        assert!(matches!(err, GirderError::UnresolvedTag { ref tag, .. } if tag == "#ghost"));
    }

    #[test]
    fn tag_flow_rejects_producing_foreign_tags() {
        let graph = Graph::from_json(
            r##"{
                "agents": [{
                    "name": "A",
                    "nodes": [
                        {"name": "Owner", "outputs": ["#owned"]},
                        {
                            "name": "Intruder",
                            "tasks": [
                                {"name": "tag", "arguments": {"files": "*.o", "with": "#owned"}}
                            ]
                        }
                    ]
                }]
            }"##,
        )
        .unwrap();
        let node = graph.node("Intruder").unwrap();
        let registry = TaskRegistry::with_defaults();
        let err =
            bind_node_tasks(&registry, node, &graph, &props(), Path::new("/w")).unwrap_err();
        assert!(matches!(err, GirderError::UnresolvedTag { ref tag, .. } if tag == "#owned"));
    }
}
