//! Shared types and errors for the girder build orchestrator.
//!
//! This crate provides the foundational types used across all other girder
//! crates:
//! - `GirderError` — unified error taxonomy
//! - `ScriptLocation` — source position inside a build graph script
//! - process exit-code mapping for the CLI

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ScriptLocation
// ---------------------------------------------------------------------------

/// A position inside a build graph script, attached to diagnostics so the
/// user can find the offending element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLocation {
    pub file: String,
    pub line: usize,
}

impl std::fmt::Display for ScriptLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.file, self.line)
    }
}

impl ScriptLocation {
    pub fn new(file: impl Into<String>, line: usize) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

fn fmt_location(location: &Option<ScriptLocation>) -> String {
    match location {
        Some(loc) => format!(" at {loc}"),
        None => String::new(),
    }
}

fn fmt_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// GirderError
// ---------------------------------------------------------------------------

/// Unified error type for all girder subsystems.
#[derive(Debug, thiserror::Error)]
pub enum GirderError {
    // === User input errors ===
    #[error("Unknown task '{task}'{}", fmt_location(.location))]
    UnknownTask {
        task: String,
        location: Option<ScriptLocation>,
    },

    #[error("Task '{task}' is missing required parameter '{parameter}'{}", fmt_location(.location))]
    MissingParameter {
        task: String,
        parameter: String,
        location: Option<ScriptLocation>,
    },

    #[error("Tag '{tag}' is not available here{}: {reason}", fmt_location(.location))]
    UnresolvedTag {
        tag: String,
        reason: String,
        location: Option<ScriptLocation>,
    },

    #[error("Unknown target '{target}'")]
    UnknownTarget { target: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Graph integrity errors ===
    #[error("Cycle detected in action graph:\n{description}")]
    CycleDetected { description: String },

    #[error("Conflicting producers for '{item}' ({fields}):\n{dump}")]
    DuplicateProducer {
        item: String,
        fields: String,
        dump: String,
    },

    #[error("Path '{path}' is {length} characters long, limit is {limit}")]
    PathTooLong {
        path: String,
        length: usize,
        limit: usize,
    },

    // === Cache corruption ===
    #[error("Failed to parse dependency file {}: {reason}", .path.display())]
    MalformedDependencyFile { path: PathBuf, reason: String },

    #[error("Cache at {} is unreadable: {reason}", .path.display())]
    CacheCorruption { path: PathBuf, reason: String },

    // === Execution errors ===
    #[error("One or more actions failed to build")]
    ActionsFailed,

    #[error("Action '{description}' did not produce declared output(s): {}", fmt_paths(.items))]
    MissingOutputs {
        description: String,
        items: Vec<PathBuf>,
    },

    // === Clobber detection ===
    #[error("Node '{node}' modified its input file(s): {}", fmt_paths(.files))]
    InputClobbered { node: String, files: Vec<PathBuf> },

    // === Token contention ===
    #[error("Token {} is held by '{owner}'", .token.display())]
    TokenContention { token: PathBuf, owner: String },

    // === Engine-change refusal ===
    #[error("Build would modify {} engine file(s): {}", .files.len(), fmt_paths(.files))]
    EngineChangesRefused { files: Vec<PathBuf> },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// A convenience alias for `Result<T, GirderError>`.
pub type Result<T> = std::result::Result<T, GirderError>;

/// Process exit code for a failed action set (distinct from engine errors so
/// wrapping scripts can tell a compilation failure from a misconfiguration).
pub const EXIT_ACTIONS_FAILED: i32 = 2;

/// Process exit code for the engine-change refusal described by the
/// `no-engine-changes` option.
pub const EXIT_ENGINE_CHANGES_REFUSED: i32 = 3;

impl GirderError {
    /// Maps the error to the process exit code the CLI should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            GirderError::ActionsFailed | GirderError::MissingOutputs { .. } => EXIT_ACTIONS_FAILED,
            GirderError::EngineChangesRefused { .. } => EXIT_ENGINE_CHANGES_REFUSED,
            _ => 1,
        }
    }

    /// Returns `true` for conditions that a build may recover from by
    /// discarding the offending cache entry and rebuilding, rather than
    /// aborting. The outdatedness probe treats these as cache misses.
    pub fn is_cache_recoverable(&self) -> bool {
        matches!(
            self,
            GirderError::CacheCorruption { .. } | GirderError::MalformedDependencyFile { .. }
        )
    }

    /// Returns `true` if the error originates from bad user input (script,
    /// flags, target names) rather than from the build itself.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            GirderError::UnknownTask { .. }
                | GirderError::MissingParameter { .. }
                | GirderError::UnresolvedTag { .. }
                | GirderError::UnknownTarget { .. }
                | GirderError::InvalidArgument(_)
        )
    }
}
