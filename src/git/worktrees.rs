//! Worktree management for GitManager
//!
//! Contains methods for creating, listing, and removing worktrees

use git2::{BranchType, Error as GitError, Repository, Worktree, WorktreeAddOptions, WorktreePruneOptions};
use std::path::Path;

use crate::git::types::WorktreeInfo;
use crate::git::GitManager;

impl GitManager {
    /// Create a worktree at `path` checked out on the existing local `branch`
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo, GitError> {
        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Branch names like "prefix/issue" would nest under .git/worktrees/
        let worktree_name = worktree_name_for(branch);

        // A stale admin entry with the same name blocks creation
        if let Ok(stale) = self.repo.find_worktree(&worktree_name) {
            log::warn!(
                "[GitManager] Pruning stale worktree entry '{}' before re-creating it",
                worktree_name
            );
            prune_worktree(&stale)?;
        }

        let worktree = self.repo.worktree(&worktree_name, path, Some(&opts))?;

        self.worktree_to_info(&worktree)
    }

    /// List all linked worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove a worktree by path, deleting its working directory.
    ///
    /// Returns `Ok(false)` when no worktree is registered at that path.
    pub fn remove_worktree(&self, path: &Path) -> Result<bool, GitError> {
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if same_path(worktree.path(), path) {
                    prune_worktree(&worktree)?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Prune orphaned worktrees (where the physical directory no longer exists)
    /// This cleans up stale entries in .git/worktrees/
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if !worktree.path().exists() {
                    log::info!(
                        "[GitManager] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree.path()
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[GitManager] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Convert a Worktree to WorktreeInfo
    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();
        let is_locked = worktree
            .is_locked()
            .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
            .unwrap_or(false);

        let branch = Repository::open(worktree.path()).ok().and_then(|wt_repo| {
            let head = wt_repo.head().ok()?;
            if head.is_branch() {
                head.shorthand().map(|s| s.to_string())
            } else {
                None
            }
        });

        Ok(WorktreeInfo {
            name,
            path,
            branch,
            is_locked,
        })
    }
}

/// Admin-directory name git2 uses for the worktree of `branch`
pub(crate) fn worktree_name_for(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Prune a worktree's admin entry and its working directory, valid or not
fn prune_worktree(worktree: &Worktree) -> Result<(), GitError> {
    let mut opts = WorktreePruneOptions::new();
    opts.valid(true).working_tree(true);
    worktree.prune(Some(&mut opts))
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => {
            a.to_string_lossy().trim_end_matches('/') == b.to_string_lossy().trim_end_matches('/')
        }
    }
}
