//! Incremental action graph engine.
//!
//! This crate implements the planning half of girder: canonical file-item
//! handles, the compiler dependency cache, action history, action graph
//! linking and conflict analysis, the outdatedness computation, the per-target
//! makefile cache, and the pluggable executor that runs the outdated subset.

pub mod action;
pub mod archive;
pub mod depcache;
pub mod executor;
pub mod export;
pub mod file_item;
pub mod history;
pub mod link;
pub mod makefile;
pub mod outdated;
pub mod session;
pub mod toolchain;

pub use action::{Action, ActionType, LinkedAction};
pub use depcache::{DependencyCache, DependencyImport, DependencyInfo};
pub use executor::{split_command_arguments, ActionExecutor, ExecutorRegistry, LocalExecutor};
pub use export::export_action_graph;
pub use file_item::{FileItem, FileItemCache};
pub use history::{ActionHistory, ActionHistorySet};
pub use link::{check_for_conflicts, check_path_lengths, link, merge_action_sets, ActionGraph};
pub use makefile::TargetMakefile;
pub use outdated::{compute_outdated, prepare_outdated, OutdatedContext, OutdatedOptions};
pub use session::{BuildOptions, BuildOutcome, BuildSession};
pub use toolchain::{TargetDescriptor, ToolchainAdapter};
