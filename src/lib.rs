// Clippy allows for reasonable defaults
#![allow(clippy::too_many_arguments)] // Component constructors take their collaborators explicitly
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::unnecessary_map_or)] // map_or can be clearer than alternatives

//! Concurrent issue processing orchestrator
//!
//! Runs an external agent once per issue of a dependency graph, each in its
//! own git worktree, and merges the results into a shared integration branch
//! through a single serialized merge lane.

// Module declarations
pub mod config;
pub mod error;
pub mod file_storage;
pub mod git;
pub mod orchestrator;
pub mod scope_lock;
pub mod shutdown;
mod utils;

pub use config::{load_config, LeftoverPolicy, OrchestratorConfig, PartialConfig, RetryConfig};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{
    AgentExecutor, AgentOutcome, CommandAgent, DependencyGraph, ItemStatus, Orchestrator,
    RunReport, WorkItem,
};
pub use scope_lock::{AcquireOutcome, LockRecord, ScopeLease, ScopeLockManager};
pub use shutdown::ShutdownState;
pub use utils::generate_run_id;
