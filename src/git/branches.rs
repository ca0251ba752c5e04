//! Branch operations for GitManager
//!
//! Contains methods for creating, deleting, listing and resolving branches

use git2::{Branch, BranchType, Commit, Error as GitError};

use crate::git::types::{BranchInfo, CommitInfo};
use crate::git::GitManager;

impl GitManager {
    /// Create a new branch pointing at the current tip of `base_branch`
    pub fn create_branch_from(
        &self,
        name: &str,
        base_branch: &str,
        force: bool,
    ) -> Result<BranchInfo, GitError> {
        let base = self.repo.find_branch(base_branch, BranchType::Local)?;
        let base_commit = base.get().peel_to_commit()?;
        let branch = self.repo.branch(name, &base_commit, force)?;

        self.branch_to_info(&branch)
    }

    /// Delete a local branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    /// Check whether a local branch exists
    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Resolve the commit id at the tip of a local branch
    pub fn branch_tip(&self, name: &str) -> Result<String, GitError> {
        let branch = self.repo.find_branch(name, BranchType::Local)?;
        Ok(branch.get().peel_to_commit()?.id().to_string())
    }

    /// List local branches whose name starts with `prefix`
    pub fn list_branches_with_prefix(&self, prefix: &str) -> Result<Vec<BranchInfo>, GitError> {
        let branches = self.repo.branches(Some(BranchType::Local))?;

        let mut result = Vec::new();
        for branch in branches {
            let (branch, _) = branch?;
            if branch.name()?.is_some_and(|n| n.starts_with(prefix)) {
                result.push(self.branch_to_info(&branch)?);
            }
        }

        Ok(result)
    }

    /// Number of commits on `branch` that are not reachable from `base`
    pub fn commits_ahead(&self, branch: &str, base: &str) -> Result<usize, GitError> {
        let branch_oid = self
            .repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        let base_oid = self
            .repo
            .find_branch(base, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();

        let (ahead, _behind) = self.repo.graph_ahead_behind(branch_oid, base_oid)?;
        Ok(ahead)
    }

    /// Name of the branch HEAD points to, if HEAD is a branch
    pub fn head_branch_name(&self) -> Option<String> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }
        head.shorthand().map(|s| s.to_string())
    }

    /// Get the default branch name for this repository.
    ///
    /// Resolution order:
    /// 1. Current HEAD branch (if HEAD points to a branch)
    /// 2. First existing common default branch ("main", "master")
    /// 3. Fallback to "main"
    pub fn get_default_branch_name(&self) -> String {
        if let Some(name) = self.head_branch_name() {
            return name;
        }

        for name in &["main", "master"] {
            if self.branch_exists(name) {
                return (*name).to_string();
            }
        }

        "main".to_string()
    }

    /// Convert a Branch to BranchInfo
    pub(crate) fn branch_to_info(&self, branch: &Branch) -> Result<BranchInfo, GitError> {
        let name = branch.name()?.unwrap_or("").to_string();
        let commit = branch.get().peel_to_commit()?;

        Ok(BranchInfo {
            name,
            is_head: branch.is_head(),
            commit_id: commit.id().to_string(),
        })
    }

    /// Convert a Commit to CommitInfo
    pub(crate) fn commit_to_info(&self, commit: &Commit) -> Result<CommitInfo, GitError> {
        let author = commit.author();
        let id = commit.id().to_string();

        Ok(CommitInfo {
            short_id: id.chars().take(7).collect(),
            id,
            message: commit.message().unwrap_or("").to_string(),
            author: author.name().unwrap_or("").to_string(),
            email: author.email().unwrap_or("").to_string(),
            timestamp: commit.time().seconds(),
            parent_ids: commit.parent_ids().map(|oid| oid.to_string()).collect(),
        })
    }
}
