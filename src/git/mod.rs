//! Git operations using git2-rs
//!
//! This module provides the source-control primitives the orchestrator needs,
//! organized into focused submodules:
//! - `manager` - Core GitManager struct
//! - `branches` - Branch operations (create from tip, delete, resolve tips)
//! - `worktrees` - Worktree management (add, remove, prune, list)
//! - `commits` - Committing agent output inside a worktree
//! - `merge` - Merging into the integration branch and conflict detection
//! - `status` - Working tree status checks
//! - `types` - Shared data structures

mod branches;
mod commits;
mod manager;
mod merge;
mod status;
#[cfg(test)]
mod tests;
mod types;
mod worktrees;

pub use manager::GitManager;

pub use types::{BranchInfo, CommitInfo, MergeResult, WorktreeInfo};
