//! The graph runner: target resolution, culling, token acquisition, node
//! execution, and tag routing through temp storage.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;

use girder_types::{GirderError, Result};

use crate::binding::{bind_node_tasks, TaskRegistry};
use crate::model::{Graph, Node};
use crate::storage::{TempStorage, TempStorageBlock};
use crate::task::{walk_files, TaskContext};
use crate::token::{AcquireOutcome, TokenStore};

/// What to do when a required token is held by another owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPolicy {
    /// Roll back tokens created in this sweep and abort.
    #[default]
    FailFast,
    /// Drop the blocked nodes (and their dependents) from the target set.
    SkipMissing,
}

/// Options for one graph run, mirroring the driver's command line.
#[derive(Debug, Clone, Default)]
pub struct GraphRunnerOptions {
    pub targets: Vec<String>,
    /// Run exactly this node, without pulling in its dependencies.
    pub single_node: Option<String>,
    /// Activated trigger, if any.
    pub trigger: Option<String>,
    /// Treat every trigger as activated.
    pub skip_triggers: bool,
    /// Treat these specific triggers as activated.
    pub skipped_triggers: Vec<String>,
    /// Skip nodes already marked complete (after an integrity check).
    pub resume: bool,
    pub clean: bool,
    pub clean_nodes: Vec<String>,
    /// Print the plan without executing.
    pub list_only: bool,
    pub show_deps: bool,
    pub token_policy: TokenPolicy,
}

/// Summary of one graph run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphRunResult {
    pub planned_nodes: Vec<String>,
    pub executed_nodes: Vec<String>,
    /// Nodes dropped by resume or by the skip-missing token policy.
    pub skipped_nodes: Vec<String>,
}

/// Drives a parsed graph through selection, tokens, and execution.
pub struct GraphRunner {
    graph: Graph,
    storage: TempStorage,
    tokens: TokenStore,
    registry: TaskRegistry,
    workspace_root: PathBuf,
    properties: BTreeMap<String, String>,
    options: GraphRunnerOptions,
}

impl GraphRunner {
    pub fn new(
        graph: Graph,
        workspace_root: impl Into<PathBuf>,
        storage: TempStorage,
        tokens: TokenStore,
        options: GraphRunnerOptions,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let mut properties = crate::model::standard_properties(&workspace_root);
        properties.extend(graph.properties.clone());
        Self {
            graph,
            storage,
            tokens,
            registry: TaskRegistry::with_defaults(),
            workspace_root,
            properties,
            options,
        }
    }

    pub fn registry_mut(&mut self) -> &mut TaskRegistry {
        &mut self.registry
    }

    fn trigger_is_active(&self, trigger: &str) -> bool {
        self.options.skip_triggers
            || self.options.trigger.as_deref() == Some(trigger)
            || self.options.skipped_triggers.iter().any(|t| t == trigger)
    }

    fn node_is_eligible(&self, node: &str) -> bool {
        match self.graph.agent_of(node).and_then(|a| a.trigger.as_ref()) {
            Some(trigger) => self.trigger_is_active(trigger),
            None => true,
        }
    }

    /// Nodes each node depends on, resolved through the tag map.
    fn dependencies_of(&self, node: &Node) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        for input in &node.inputs {
            if let Some(producer) = self.graph.producer_of_tag(input) {
                if !deps.contains(&producer.name) {
                    deps.push(producer.name.clone());
                }
            }
        }
        deps
    }

    /// Resolve targets and cull to the transitive input closure, keeping
    /// declaration order.
    pub fn plan(&self) -> Result<Vec<String>> {
        let mut selected: BTreeSet<String> = BTreeSet::new();

        if let Some(single) = &self.options.single_node {
            if self.graph.node(single).is_none() {
                return Err(GirderError::UnknownTarget {
                    target: single.clone(),
                });
            }
            selected.insert(single.clone());
        } else {
            if self.options.targets.is_empty() {
                return Err(GirderError::InvalidArgument(
                    "no target specified".to_string(),
                ));
            }
            let mut queue: VecDeque<String> = VecDeque::new();
            for target in &self.options.targets {
                for name in self.graph.resolve_target(target)? {
                    queue.push_back(name);
                }
            }
            while let Some(name) = queue.pop_front() {
                if !selected.insert(name.clone()) {
                    continue;
                }
                let node = self.graph.node(&name).expect("selected nodes exist");
                for dep in self.dependencies_of(node) {
                    queue.push_back(dep);
                }
            }
        }

        Ok(self
            .graph
            .nodes_in_order()
            .filter(|n| selected.contains(&n.name))
            .filter(|n| {
                let eligible = self.node_is_eligible(&n.name);
                if !eligible {
                    tracing::info!(
                        node = %n.name,
                        "node is behind an inactive trigger; expecting its outputs in storage"
                    );
                }
                eligible
            })
            .map(|n| n.name.clone())
            .collect())
    }

    /// Acquire the union of required tokens for the planned nodes.
    ///
    /// Returns the (possibly reduced) plan. Tokens acquired are held for the
    /// lifetime of the job; under skip-missing even the ones whose nodes got
    /// dropped stay held.
    fn acquire_tokens(&self, plan: Vec<String>, skipped: &mut Vec<String>) -> Result<Vec<String>> {
        let mut required: Vec<PathBuf> = Vec::new();
        for name in &plan {
            let node = self.graph.node(name).expect("planned nodes exist");
            for token in &node.required_tokens {
                if !required.contains(token) {
                    required.push(token.clone());
                }
            }
        }

        let mut acquired: Vec<PathBuf> = Vec::new();
        let mut blocked: Vec<(PathBuf, String)> = Vec::new();
        for token in required {
            match self.tokens.try_acquire(&token)? {
                AcquireOutcome::Acquired => acquired.push(token),
                AcquireOutcome::Held(owner) => blocked.push((token, owner)),
            }
        }

        if blocked.is_empty() {
            return Ok(plan);
        }

        match self.options.token_policy {
            TokenPolicy::FailFast => {
                for token in &acquired {
                    self.tokens.release(token)?;
                }
                let (token, owner) = blocked.into_iter().next().expect("non-empty");
                Err(GirderError::TokenContention { token, owner })
            }
            TokenPolicy::SkipMissing => {
                let blocked_tokens: HashSet<&PathBuf> = blocked.iter().map(|(t, _)| t).collect();
                let mut dropped: BTreeSet<String> = plan
                    .iter()
                    .filter(|name| {
                        self.graph
                            .node(name)
                            .expect("planned nodes exist")
                            .required_tokens
                            .iter()
                            .any(|t| blocked_tokens.contains(t))
                    })
                    .cloned()
                    .collect();

                // Dependents of dropped nodes cannot run either.
                loop {
                    let mut grew = false;
                    for name in &plan {
                        if dropped.contains(name) {
                            continue;
                        }
                        let node = self.graph.node(name).expect("planned nodes exist");
                        if self
                            .dependencies_of(node)
                            .iter()
                            .any(|dep| dropped.contains(dep))
                        {
                            dropped.insert(name.clone());
                            grew = true;
                        }
                    }
                    if !grew {
                        break;
                    }
                }

                for (token, owner) in &blocked {
                    tracing::warn!(
                        token = %token.display(),
                        %owner,
                        "token held elsewhere; skipping its dependent nodes"
                    );
                }
                skipped.extend(dropped.iter().cloned());
                Ok(plan.into_iter().filter(|n| !dropped.contains(n)).collect())
            }
        }
    }

    /// Run the job.
    pub async fn run(&self) -> Result<GraphRunResult> {
        let mut result = GraphRunResult::default();

        if self.options.clean {
            self.storage.clean_local()?;
        }
        for node in &self.options.clean_nodes {
            self.storage.clean_local_node(node)?;
        }

        let plan = self.plan()?;
        result.planned_nodes = plan.clone();

        if self.options.list_only || self.options.show_deps {
            for name in &plan {
                let node = self.graph.node(name).expect("planned nodes exist");
                if self.options.show_deps {
                    tracing::info!(
                        node = %name,
                        dependencies = %self.dependencies_of(node).join(", "),
                        outputs = %node.outputs.join(", "),
                        "planned"
                    );
                } else {
                    tracing::info!(node = %name, "planned");
                }
            }
            return Ok(result);
        }

        let plan = self.acquire_tokens(plan, &mut result.skipped_nodes)?;

        for name in &plan {
            let node = self.graph.node(name).expect("planned nodes exist");

            if self.options.resume && self.storage.is_complete(name) {
                if self.storage.check_local_integrity(name, &node.outputs)? {
                    tracing::info!(node = %name, "already complete; skipping");
                    result.skipped_nodes.push(name.clone());
                    continue;
                }
                tracing::info!(node = %name, "completion marker invalidated; re-running");
            }

            self.execute_node(node).await?;
            result.executed_nodes.push(name.clone());
        }

        // Reports are passive aggregations over node outcomes.
        for report in &self.graph.reports {
            let executed = report
                .nodes
                .iter()
                .filter(|n| result.executed_nodes.contains(n))
                .count();
            let skipped = report
                .nodes
                .iter()
                .filter(|n| result.skipped_nodes.contains(n))
                .count();
            tracing::info!(
                report = %report.name,
                executed,
                skipped,
                total = report.nodes.len(),
                "report"
            );
        }

        Ok(result)
    }

    async fn execute_node(&self, node: &Node) -> Result<()> {
        tracing::info!(node = %node.name, "executing node");
        let tasks = bind_node_tasks(
            &self.registry,
            node,
            &self.graph,
            &self.properties,
            &self.workspace_root,
        )?;

        let mut ctx = TaskContext::new(&self.workspace_root, self.properties.clone());
        for output in &node.outputs {
            ctx.declare_tag(output);
        }

        // Stage inputs: pull each input tag's file list, retrieve the blocks
        // it references, and record every input file's hash so clobber
        // damage can be pinned after the node runs.
        let mut input_hashes: HashMap<PathBuf, String> = HashMap::new();
        for input in &node.inputs {
            let producer = self
                .graph
                .producer_of_tag(input)
                .expect("validated at load");
            let list = self.storage.read_file_list(&producer.name, input)?;

            let mut recorded: HashMap<String, String> = HashMap::new();
            let mut blocks: Vec<&TempStorageBlock> = list.blocks.iter().collect();
            blocks.dedup();
            for block in blocks {
                let manifest = self.storage.retrieve(&block.node, &block.output)?;
                for file in manifest.files {
                    recorded.insert(file.relative_path, file.hash);
                }
            }

            for relative in &list.files {
                let absolute = self.workspace_root.join(relative);
                let hash = match recorded.get(relative) {
                    Some(hash) => hash.clone(),
                    None => file_hash(&absolute)?,
                };
                input_hashes.insert(absolute.clone(), hash);
                ctx.add_to_tag(input, absolute);
            }
        }

        // Snapshot the workspace so new output files can be identified.
        // Locally archived blocks may live inside the workspace; they are
        // never node outputs.
        let storage_root = self.storage.local_root().to_path_buf();
        let mut before = Vec::new();
        walk_files(&self.workspace_root, &mut before);
        let before: HashSet<PathBuf> = before
            .into_iter()
            .filter(|f| !f.starts_with(&storage_root))
            .collect();

        // Run tasks in declared order, greedily merging adjacent tasks into
        // a batch when the leading task offers an executor that consents.
        let mut i = 0;
        while i < tasks.len() {
            let mut merged = false;
            if let Some(mut batch) = tasks[i].make_batch_executor() {
                if batch.absorb(tasks[i].as_ref()) {
                    let mut j = i + 1;
                    while j < tasks.len() && batch.absorb(tasks[j].as_ref()) {
                        j += 1;
                    }
                    batch.run(&mut ctx).await?;
                    i = j;
                    merged = true;
                }
            }
            if !merged {
                tasks[i].execute(&mut ctx).await?;
                i += 1;
            }
        }

        // Clobber guarantee: input files must come out byte-identical.
        let mut damaged: Vec<PathBuf> = Vec::new();
        for (file, expected) in &input_hashes {
            let actual = std::fs::read(file).ok().map(|b| {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(&b);
                hex::encode(hasher.finalize())
            });
            if actual.as_deref() != Some(expected.as_str()) {
                damaged.push(file.clone());
            }
        }
        if !damaged.is_empty() {
            damaged.sort();
            return Err(GirderError::InputClobbered {
                node: node.name.clone(),
                files: damaged,
            });
        }

        // Partition outputs. Explicitly tagged files keep their tags; any
        // new file nobody tagged lands in the default output tag.
        let mut after = Vec::new();
        walk_files(&self.workspace_root, &mut after);
        let new_files: BTreeSet<PathBuf> = after
            .into_iter()
            .filter(|f| !f.starts_with(&storage_root))
            .filter(|f| !before.contains(f))
            .collect();
        let explicitly_tagged: BTreeSet<PathBuf> = ctx
            .tag_sets
            .values()
            .flat_map(|files| files.iter().cloned())
            .collect();
        let default_tag = node.default_output_tag();
        for file in new_files {
            if !explicitly_tagged.contains(&file) {
                ctx.add_to_tag(&default_tag, file);
            }
        }

        // Each file is archived in exactly one block (the first declared
        // output tag claiming it); file lists then reference the blocks
        // their files live in.
        let mut file_block: HashMap<PathBuf, TempStorageBlock> = HashMap::new();
        let mut block_files: Vec<(TempStorageBlock, Vec<PathBuf>)> = Vec::new();
        for output in &node.outputs {
            let block = TempStorageBlock {
                node: node.name.clone(),
                output: output.trim_start_matches('#').to_string(),
            };
            let mut claimed = Vec::new();
            for file in ctx.tag_files(output).cloned().unwrap_or_default() {
                if !file_block.contains_key(&file) {
                    file_block.insert(file.clone(), block.clone());
                    claimed.push(file);
                }
            }
            block_files.push((block, claimed));
        }
        for (block, files) in &block_files {
            if !files.is_empty() {
                self.storage.archive(&block.node, &block.output, files)?;
            }
        }
        for output in &node.outputs {
            let files: Vec<PathBuf> = ctx
                .tag_files(output)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            let mut blocks: Vec<TempStorageBlock> = Vec::new();
            for file in &files {
                if let Some(block) = file_block.get(file) {
                    if !blocks.contains(block) {
                        blocks.push(block.clone());
                    }
                }
            }
            self.storage.write_file_list(&node.name, output, &files, &blocks)?;
        }

        self.storage.mark_complete(&node.name)?;
        Ok(())
    }
}

fn file_hash(path: &std::path::Path) -> Result<String> {
    use sha2::{Digest, Sha256};
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Render the culled graph for external orchestrators: nodes with their
/// dependencies, tags, tokens, and the trigger gating each agent.
pub fn export_graph(graph: &Graph, plan: &[String]) -> serde_json::Value {
    let planned: HashSet<&str> = plan.iter().map(String::as_str).collect();
    let mut nodes = Vec::new();
    for agent in &graph.agents {
        for node in &agent.nodes {
            if !planned.contains(node.name.as_str()) {
                continue;
            }
            let depends_on: Vec<String> = node
                .inputs
                .iter()
                .filter_map(|input| graph.producer_of_tag(input).map(|n| n.name.clone()))
                .collect();
            nodes.push(serde_json::json!({
                "name": node.name,
                "agent": agent.name,
                "trigger": agent.trigger,
                "depends_on": depends_on,
                "inputs": node.inputs,
                "outputs": node.outputs,
                "required_tokens": node.required_tokens,
            }));
        }
    }
    serde_json::json!({
        "nodes": nodes,
        "triggers": graph.triggers.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_json() -> &'static str {
        r##"{
            "agents": [{
                "name": "Agent",
                "nodes": [
                    {
                        "name": "Produce",
                        "outputs": ["#artifacts"],
                        "tasks": [
                            {"name": "command", "arguments": {"command": "/bin/sh", "arguments": "-c \"printf payload > foo.bin\""}},
                            {"name": "tag", "arguments": {"files": "foo.bin", "with": "#artifacts"}}
                        ]
                    },
                    {
                        "name": "Consume",
                        "inputs": ["#artifacts"],
                        "tasks": [
                            {"name": "copy", "arguments": {"files": "#artifacts", "to": "staged"}}
                        ]
                    }
                ]
            }]
        }"##
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: PathBuf,
        temp_root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let workspace = dir.path().join("workspace");
            std::fs::create_dir_all(&workspace).unwrap();
            let temp_root = dir.path().join("temp");
            Self {
                _dir: dir,
                workspace,
                temp_root,
            }
        }

        fn runner(&self, graph: Graph, options: GraphRunnerOptions) -> GraphRunner {
            GraphRunner::new(
                graph,
                &self.workspace,
                TempStorage::new(&self.workspace, &self.temp_root),
                TokenStore::new("test-job"),
                options,
            )
        }
    }

    #[test]
    fn plan_culls_to_transitive_inputs() {
        let fx = Fixture::new();
        let graph = Graph::from_json(graph_json()).unwrap();
        let runner = fx.runner(
            graph,
            GraphRunnerOptions {
                targets: vec!["Consume".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(runner.plan().unwrap(), vec!["Produce", "Consume"]);
    }

    #[test]
    fn single_node_skips_dependencies() {
        let fx = Fixture::new();
        let graph = Graph::from_json(graph_json()).unwrap();
        let runner = fx.runner(
            graph,
            GraphRunnerOptions {
                single_node: Some("Consume".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(runner.plan().unwrap(), vec!["Consume"]);
    }

    #[test]
    fn unknown_target_is_fatal() {
        let fx = Fixture::new();
        let graph = Graph::from_json(graph_json()).unwrap();
        let runner = fx.runner(
            graph,
            GraphRunnerOptions {
                targets: vec!["Ghost".to_string()],
                ..Default::default()
            },
        );
        assert!(matches!(
            runner.plan(),
            Err(GirderError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn inactive_triggers_exclude_their_nodes() {
        let json = r#"{
            "triggers": [{"name": "Nightly"}],
            "agents": [
                {"name": "A", "nodes": [{"name": "Always"}]},
                {"name": "B", "trigger": "Nightly", "nodes": [{"name": "Gated"}]}
            ]
        }"#;
        let fx = Fixture::new();

        let runner = fx.runner(
            Graph::from_json(json).unwrap(),
            GraphRunnerOptions {
                targets: vec!["Always".to_string(), "Gated".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(runner.plan().unwrap(), vec!["Always"]);

        let runner = fx.runner(
            Graph::from_json(json).unwrap(),
            GraphRunnerOptions {
                targets: vec!["Always".to_string(), "Gated".to_string()],
                trigger: Some("Nightly".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(runner.plan().unwrap(), vec!["Always", "Gated"]);

        let runner = fx.runner(
            Graph::from_json(json).unwrap(),
            GraphRunnerOptions {
                targets: vec!["Gated".to_string()],
                skip_triggers: true,
                ..Default::default()
            },
        );
        assert_eq!(runner.plan().unwrap(), vec!["Gated"]);
    }

    #[tokio::test]
    async fn list_only_plans_without_executing() {
        let fx = Fixture::new();
        let graph = Graph::from_json(graph_json()).unwrap();
        let runner = fx.runner(
            graph,
            GraphRunnerOptions {
                targets: vec!["Consume".to_string()],
                list_only: true,
                ..Default::default()
            },
        );
        let result = runner.run().await.unwrap();
        assert_eq!(result.planned_nodes, vec!["Produce", "Consume"]);
        assert!(result.executed_nodes.is_empty());
        assert!(!fx.workspace.join("foo.bin").exists());
    }

    #[test]
    fn export_describes_the_culled_graph() {
        let graph = Graph::from_json(graph_json()).unwrap();
        let doc = export_graph(&graph, &["Produce".to_string(), "Consume".to_string()]);
        let nodes = doc["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1]["name"], "Consume");
        assert_eq!(nodes[1]["depends_on"][0], "Produce");
        assert_eq!(nodes[0]["outputs"][1], "#artifacts");
    }
}
