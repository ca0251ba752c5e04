//! Status operations for GitManager
//!
//! Contains methods for inspecting the working tree

use git2::{Error as GitError, StatusOptions};

use crate::git::GitManager;

impl GitManager {
    /// Paths with uncommitted changes (including untracked files)
    pub fn changed_paths(&self) -> Result<Vec<String>, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        opts.recurse_untracked_dirs(true);
        opts.include_ignored(false);

        let statuses = self.repo.statuses(Some(&mut opts))?;

        Ok(statuses
            .iter()
            .filter_map(|entry| entry.path().map(|p| p.to_string()))
            .collect())
    }

    /// Check whether the working tree has uncommitted changes
    pub fn has_uncommitted_changes(&self) -> Result<bool, GitError> {
        Ok(!self.changed_paths()?.is_empty())
    }
}
