//! Merge and conflict handling for GitManager
//!
//! Merges are computed in memory against the target branch tip. The target
//! ref only moves when the merge is clean, so a conflicting attempt needs no
//! abort step and leaves the target branch untouched.
//!
//! When the target branch is checked out in the main working copy, the new
//! tree is checked out while HEAD still points at the old tip, then the ref
//! moves. The working copy and index never lag behind the branch.

use git2::{build::CheckoutBuilder, BranchType, Error as GitError, Index, MergeOptions, Oid};

use crate::git::types::MergeResult;
use crate::git::GitManager;

impl GitManager {
    /// Merge a source branch into a target branch
    /// Returns MergeResult with details about the merge outcome
    pub fn merge_branch(
        &self,
        source_branch: &str,
        target_branch: &str,
    ) -> Result<MergeResult, GitError> {
        log::info!(
            "[GitManager] Merging {} into {}",
            source_branch,
            target_branch
        );

        let source_commit = self
            .repo
            .find_branch(source_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        let target_commit = self
            .repo
            .find_branch(target_branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        let source_id = source_commit.id();
        let target_id = target_commit.id();

        if source_id == target_id || self.repo.graph_descendant_of(target_id, source_id)? {
            log::info!("[GitManager] {} already up to date", target_branch);
            return Ok(MergeResult {
                success: true,
                message: "Already up to date".to_string(),
                conflict_files: vec![],
                commit_id: Some(target_id.to_string()),
                fast_forward: false,
            });
        }

        if self.repo.graph_descendant_of(source_id, target_id)? {
            log::info!("[GitManager] Fast-forward merge possible");

            self.advance_target(
                target_branch,
                source_id,
                &format!(
                    "Fast-forward merge {} into {}",
                    source_branch, target_branch
                ),
            )?;

            return Ok(MergeResult {
                success: true,
                message: format!(
                    "Fast-forward merged {} into {}",
                    source_branch, target_branch
                ),
                conflict_files: vec![],
                commit_id: Some(source_id.to_string()),
                fast_forward: true,
            });
        }

        let merge_opts = MergeOptions::new();
        let mut index = self
            .repo
            .merge_commits(&target_commit, &source_commit, Some(&merge_opts))?;

        if index.has_conflicts() {
            let conflict_files = conflict_paths(&index)?;
            log::warn!("[GitManager] Merge has conflicts: {:?}", conflict_files);
            return Ok(MergeResult {
                success: false,
                message: format!("Merge conflicts in {} file(s)", conflict_files.len()),
                conflict_files,
                commit_id: None,
                fast_forward: false,
            });
        }

        let tree_id = index.write_tree_to(&self.repo)?;
        let tree = self.repo.find_tree(tree_id)?;
        let signature = self.signature()?;

        let message = format!("Merge branch '{}' into '{}'", source_branch, target_branch);
        let merge_commit = self.repo.commit(
            None,
            &signature,
            &signature,
            &message,
            &tree,
            &[&target_commit, &source_commit],
        )?;

        self.advance_target(target_branch, merge_commit, &message)?;

        log::info!("[GitManager] Merge successful: {}", merge_commit);

        Ok(MergeResult {
            success: true,
            message: format!(
                "Successfully merged {} into {}",
                source_branch, target_branch
            ),
            conflict_files: vec![],
            commit_id: Some(merge_commit.to_string()),
            fast_forward: false,
        })
    }

    /// Move `target_branch` to `new_tip`, updating the main working copy first
    /// when the branch is checked out there.
    ///
    /// The checkout is safe: local modifications that the new tree would
    /// overwrite make it fail, and then the ref is not moved either.
    fn advance_target(
        &self,
        target_branch: &str,
        new_tip: Oid,
        log_message: &str,
    ) -> Result<(), GitError> {
        if !self.repo.is_bare() && self.head_branch_name().as_deref() == Some(target_branch) {
            let commit = self.repo.find_commit(new_tip)?;
            let mut checkout = CheckoutBuilder::new();
            checkout.safe();
            self.repo
                .checkout_tree(commit.as_object(), Some(&mut checkout))
                .map_err(|e| {
                    log::warn!(
                        "[GitManager] Working copy of {} cannot be updated, leaving the branch in place: {}",
                        target_branch,
                        e
                    );
                    e
                })?;
        }

        let ref_name = format!("refs/heads/{}", target_branch);
        self.repo
            .find_reference(&ref_name)?
            .set_target(new_tip, log_message)?;
        Ok(())
    }
}

/// Collect the paths of all conflicted entries in an index
fn conflict_paths(index: &Index) -> Result<Vec<String>, GitError> {
    let mut conflict_files = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            conflict_files.push(String::from_utf8_lossy(&entry.path).to_string());
        }
    }
    conflict_files.sort();
    conflict_files.dedup();
    Ok(conflict_files)
}
