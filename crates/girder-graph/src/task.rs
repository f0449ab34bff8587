//! The task seam and the built-in task set.
//!
//! Tasks run inside a node against a [`TaskContext`] holding the live
//! tag → file-set map. A task may expose a batch executor; the runtime
//! greedily merges adjacent tasks that consent into one invocation.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use globset::{Glob, GlobSetBuilder};

use girder_types::{GirderError, Result, ScriptLocation};

/// Mutable state handed to each task: the workspace, the script properties,
/// and the tag sets accumulated so far in this node.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workspace_root: PathBuf,
    pub properties: BTreeMap<String, String>,
    pub tag_sets: BTreeMap<String, BTreeSet<PathBuf>>,
}

impl TaskContext {
    pub fn new(workspace_root: impl Into<PathBuf>, properties: BTreeMap<String, String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            properties,
            tag_sets: BTreeMap::new(),
        }
    }

    /// Ensure a tag exists, with an empty set if nothing has been added.
    pub fn declare_tag(&mut self, tag: &str) {
        self.tag_sets.entry(tag.to_string()).or_default();
    }

    pub fn add_to_tag(&mut self, tag: &str, file: PathBuf) {
        self.tag_sets.entry(tag.to_string()).or_default().insert(file);
    }

    pub fn tag_files(&self, tag: &str) -> Option<&BTreeSet<PathBuf>> {
        self.tag_sets.get(tag)
    }

    /// Resolve a script path against the workspace root.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

/// One unit of work inside a node.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    fn location(&self) -> Option<&ScriptLocation> {
        None
    }

    /// Tags this task reads, for tag-flow validation at bind time.
    fn consumed_tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Tags this task writes, for tag-flow validation at bind time.
    fn produced_tags(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    /// Batch capability: tasks that can merge with compatible neighbours
    /// return an executor here; the runtime then offers subsequent tasks to
    /// it via [`TaskBatchExecutor::absorb`].
    fn make_batch_executor(&self) -> Option<Box<dyn TaskBatchExecutor>> {
        None
    }
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name()).finish()
    }
}

/// Merges adjacent compatible tasks into a single invocation.
#[async_trait]
pub trait TaskBatchExecutor: Send {
    /// Consent to absorb `task`. Returning `false` ends the batch.
    fn absorb(&mut self, task: &dyn Task) -> bool;

    async fn run(&mut self, ctx: &mut TaskContext) -> Result<()>;
}

fn task_error(task: &dyn Task, message: String) -> GirderError {
    match task.location() {
        Some(location) => GirderError::Other(format!("{location}: {}: {message}", task.name())),
        None => GirderError::Other(format!("{}: {message}", task.name())),
    }
}

/// Split an argument string into argv entries, honouring double quotes.
pub(crate) fn split_arguments(arguments: &str) -> Vec<String> {
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

pub(crate) fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk_files(&path, out);
            } else {
                out.push(path);
            }
        }
    }
}

/// Resolve a semicolon-separated list of paths and glob patterns (or a tag
/// reference) into concrete files.
pub fn resolve_file_spec(ctx: &TaskContext, spec: &str) -> Result<Vec<PathBuf>> {
    if spec.starts_with('#') {
        return Ok(ctx
            .tag_files(spec)
            .map(|files| files.iter().cloned().collect())
            .unwrap_or_default());
    }

    let mut out = Vec::new();
    for part in spec.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        if part.contains('*') {
            let glob = Glob::new(part)
                .map_err(|e| GirderError::InvalidArgument(format!("bad pattern '{part}': {e}")))?;
            let mut builder = GlobSetBuilder::new();
            builder.add(glob);
            let set = builder
                .build()
                .map_err(|e| GirderError::InvalidArgument(format!("bad pattern '{part}': {e}")))?;

            let mut all = Vec::new();
            walk_files(&ctx.workspace_root, &mut all);
            for file in all {
                if let Ok(relative) = file.strip_prefix(&ctx.workspace_root) {
                    if set.is_match(relative) {
                        out.push(file);
                    }
                }
            }
        } else {
            out.push(ctx.resolve(part));
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// command
// ---------------------------------------------------------------------------

/// Run an external program inside the workspace.
#[derive(Debug, Clone)]
pub struct CommandTask {
    pub program: String,
    pub arguments: String,
    /// Tasks sharing a group merge into one batched invocation when
    /// adjacent.
    pub group: Option<String>,
    pub location: Option<ScriptLocation>,
}

impl CommandTask {
    async fn run_one(&self, ctx: &TaskContext) -> Result<()> {
        let output = tokio::process::Command::new(&self.program)
            .args(split_arguments(&self.arguments))
            .current_dir(&ctx.workspace_root)
            .output()
            .await
            .map_err(|e| task_error(self, format!("failed to start '{}': {e}", self.program)))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(command = %self.program, "{line}");
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            tracing::info!(command = %self.program, "{line}");
        }
        if !output.status.success() {
            return Err(task_error(
                self,
                format!(
                    "'{} {}' exited with code {}",
                    self.program,
                    self.arguments,
                    output.status.code().unwrap_or(-1)
                ),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        "command"
    }

    fn location(&self) -> Option<&ScriptLocation> {
        self.location.as_ref()
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<()> {
        self.run_one(ctx).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn make_batch_executor(&self) -> Option<Box<dyn TaskBatchExecutor>> {
        self.group.as_ref().map(|group| {
            Box::new(CommandBatch {
                group: group.clone(),
                commands: Vec::new(),
            }) as Box<dyn TaskBatchExecutor>
        })
    }
}

/// Batched command invocation: absorbs adjacent `command` tasks that share
/// its group and runs them as one unit.
struct CommandBatch {
    group: String,
    commands: Vec<CommandTask>,
}

#[async_trait]
impl TaskBatchExecutor for CommandBatch {
    fn absorb(&mut self, task: &dyn Task) -> bool {
        match task.as_any().downcast_ref::<CommandTask>() {
            Some(command) if command.group.as_deref() == Some(self.group.as_str()) => {
                self.commands.push(command.clone());
                true
            }
            _ => false,
        }
    }

    async fn run(&mut self, ctx: &mut TaskContext) -> Result<()> {
        tracing::debug!(group = %self.group, count = self.commands.len(), "running command batch");
        for command in &self.commands {
            command.run_one(ctx).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// copy
// ---------------------------------------------------------------------------

/// Copy files (a tag set, paths, or patterns) into a directory, optionally
/// tagging the copies.
#[derive(Debug, Clone)]
pub struct CopyTask {
    pub files: String,
    pub to_dir: String,
    pub tag: Option<String>,
    pub location: Option<ScriptLocation>,
}

#[async_trait]
impl Task for CopyTask {
    fn name(&self) -> &str {
        "copy"
    }

    fn location(&self) -> Option<&ScriptLocation> {
        self.location.as_ref()
    }

    fn consumed_tags(&self) -> Vec<String> {
        self.files
            .starts_with('#')
            .then(|| vec![self.files.clone()])
            .unwrap_or_default()
    }

    fn produced_tags(&self) -> Vec<String> {
        self.tag.clone().into_iter().collect()
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<()> {
        let sources = resolve_file_spec(ctx, &self.files)?;
        let destination = ctx.resolve(&self.to_dir);
        std::fs::create_dir_all(&destination)?;

        for source in sources {
            let file_name = source.file_name().ok_or_else(|| {
                task_error(self, format!("'{}' has no file name", source.display()))
            })?;
            let target = destination.join(file_name);
            std::fs::copy(&source, &target)?;
            if let Some(tag) = &self.tag {
                ctx.add_to_tag(tag, target);
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------------

/// Delete files matching the given paths or patterns.
#[derive(Debug, Clone)]
pub struct DeleteTask {
    pub files: String,
    pub location: Option<ScriptLocation>,
}

#[async_trait]
impl Task for DeleteTask {
    fn name(&self) -> &str {
        "delete"
    }

    fn location(&self) -> Option<&ScriptLocation> {
        self.location.as_ref()
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<()> {
        for file in resolve_file_spec(ctx, &self.files)? {
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// tag
// ---------------------------------------------------------------------------

/// Collect files matching paths or patterns into a tag.
#[derive(Debug, Clone)]
pub struct TagTask {
    pub files: String,
    pub tag: String,
    pub location: Option<ScriptLocation>,
}

#[async_trait]
impl Task for TagTask {
    fn name(&self) -> &str {
        "tag"
    }

    fn location(&self) -> Option<&ScriptLocation> {
        self.location.as_ref()
    }

    fn consumed_tags(&self) -> Vec<String> {
        self.files
            .starts_with('#')
            .then(|| vec![self.files.clone()])
            .unwrap_or_default()
    }

    fn produced_tags(&self) -> Vec<String> {
        vec![self.tag.clone()]
    }

    async fn execute(&self, ctx: &mut TaskContext) -> Result<()> {
        for file in resolve_file_spec(ctx, &self.files)? {
            ctx.add_to_tag(&self.tag, file);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
