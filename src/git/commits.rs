//! Commit operations for GitManager
//!
//! Contains methods for recording agent output as commits

use git2::{Error as GitError, IndexAddOption};

use crate::git::types::CommitInfo;
use crate::git::GitManager;

impl GitManager {
    /// Stage every change in the working tree, including deletions
    pub fn stage_all(&self) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    /// Stage and commit all uncommitted changes on the current branch.
    ///
    /// Returns `None` when there was nothing to commit.
    pub fn commit_all(&self, message: &str) -> Result<Option<CommitInfo>, GitError> {
        if !self.has_uncommitted_changes()? {
            return Ok(None);
        }

        self.stage_all()?;

        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent = self.repo.head()?.peel_to_commit()?;

        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let signature = self.signature()?;
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;

        let commit = self.repo.find_commit(oid)?;
        log::debug!("[GitManager] Committed {} ({})", oid, message);
        Ok(Some(self.commit_to_info(&commit)?))
    }
}
