//! Build graph pipeline runtime.
//!
//! This crate implements the scriptable half of girder: a declarative graph
//! of agents, nodes, and typed tasks, gated by triggers, producing tagged
//! file sets that flow between nodes through temp storage, with per-node
//! exclusive tokens for distributed mutual exclusion.

pub mod binding;
pub mod condition;
pub mod model;
pub mod runtime;
pub mod storage;
pub mod task;
pub mod token;

pub use binding::{
    bind_node_tasks, BoundParameters, ParamType, ParamValidation, ParamValue, TaskBinding,
    TaskParameter, TaskRegistry,
};
pub use condition::{evaluate_bool, evaluate_condition, parse_condition, Clause, ConditionExpr, Operator};
pub use model::{standard_properties, Agent, Graph, Node, Report, TaskInfo, Trigger};
pub use runtime::{export_graph, GraphRunResult, GraphRunner, GraphRunnerOptions, TokenPolicy};
pub use storage::{
    ManifestFile, TempStorage, TempStorageBlock, TempStorageFileList, TempStorageManifest,
};
pub use task::{
    CommandTask, CopyTask, DeleteTask, TagTask, Task, TaskBatchExecutor, TaskContext,
};
pub use token::{AcquireOutcome, TokenStore};
