//! The toolchain adapter seam.
//!
//! Toolchains own the semantic model of the codebase: which modules exist,
//! which source files belong to them, and how a compile or link environment
//! turns into concrete command lines. The engine only needs the resulting
//! makefile, plus the current source and working sets for validity checks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;

use girder_types::{GirderError, Result};

use crate::makefile::TargetMakefile;
use crate::session::BuildSession;

/// One buildable target: `{name, platform, configuration}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    pub name: String,
    pub platform: String,
    pub configuration: String,
}

impl TargetDescriptor {
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        configuration: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            platform: platform.into(),
            configuration: configuration.into(),
        }
    }

    /// Parse a `name:platform:configuration` triple.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [name, platform, configuration]
                if !name.is_empty() && !platform.is_empty() && !configuration.is_empty() =>
            {
                Ok(Self::new(*name, *platform, *configuration))
            }
            _ => Err(GirderError::InvalidArgument(format!(
                "expected target as name:platform:configuration, got '{spec}'"
            ))),
        }
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.name, self.platform, self.configuration)
    }
}

/// External collaborator that turns a target into a build plan.
#[async_trait]
pub trait ToolchainAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a fresh makefile for `target`.
    async fn create_makefile(
        &self,
        target: &TargetDescriptor,
        session: &BuildSession,
    ) -> Result<TargetMakefile>;

    /// Current per-module source sets for `target`, used to validate a
    /// cached makefile.
    async fn current_source_files(
        &self,
        target: &TargetDescriptor,
    ) -> Result<BTreeMap<String, BTreeSet<PathBuf>>>;

    /// Files the user is actively editing (the adaptive working set).
    async fn current_working_set(&self, target: &TargetDescriptor) -> Result<BTreeSet<PathBuf>>;
}
