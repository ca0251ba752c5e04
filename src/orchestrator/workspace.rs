//! Workspace Manager
//!
//! Gives every in-flight item its own git worktree on a dedicated branch,
//! created from the current integration tip. Branch and directory names are
//! derived from the item id, so a crashed run's leftovers can be found again
//! on the next start. The derived key carries a hash of the raw id: ids that
//! sanitize to the same text (`US-1.1`, `us-1_1`) still get distinct
//! workspaces.

use crate::error::{OrchestratorError, Result};
use crate::git::GitManager;
use crate::utils::{lock_mutex_recover, sanitize_branch_name};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Directory and branch leaf name for an item: `{sanitized id}-{hash}`.
///
/// Stable across processes, so leftovers of a crashed run map back to their item.
pub fn workspace_key(item_id: &str) -> String {
    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, item_id.as_bytes())
        .simple()
        .to_string();
    format!("{}-{}", sanitize_branch_name(item_id), &digest[..8])
}

/// Isolated working copy bound to one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub item_id: String,
    pub branch: String,
    pub path: PathBuf,
    /// Integration tip the branch was created from
    pub base_commit: String,
    /// Taken over from a previous run instead of freshly created
    pub adopted: bool,
}

/// Workspace left behind by a previous run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeftoverWorkspace {
    /// Directory name under the workspace root (the item's workspace key)
    pub key: String,
    pub branch: Option<String>,
    pub path: Option<PathBuf>,
}

impl LeftoverWorkspace {
    fn is_complete(&self) -> bool {
        self.branch.is_some() && self.path.as_ref().is_some_and(|p| p.exists())
    }
}

/// Creates and destroys per-item worktrees
pub struct WorkspaceManager {
    repo_path: PathBuf,
    workspace_root: PathBuf,
    branch_prefix: String,
    integration_branch: String,
    /// Serializes git admin operations with the merge lane
    git_lock: Arc<Mutex<()>>,
    active: Mutex<HashMap<String, Workspace>>,
    /// Leftovers offered for adoption, keyed by directory name
    adoptable: Mutex<HashMap<String, LeftoverWorkspace>>,
}

impl WorkspaceManager {
    pub fn new(
        repo_path: &Path,
        workspace_root: &Path,
        branch_prefix: &str,
        integration_branch: &str,
        git_lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(workspace_root).map_err(|e| {
            OrchestratorError::ResourceExhaustion(format!(
                "cannot create workspace root {}: {}",
                workspace_root.display(),
                e
            ))
        })?;

        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            workspace_root: workspace_root.to_path_buf(),
            branch_prefix: branch_prefix.trim_matches('/').to_string(),
            integration_branch: integration_branch.to_string(),
            git_lock,
            active: Mutex::new(HashMap::new()),
            adoptable: Mutex::new(HashMap::new()),
        })
    }

    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Branch for an item: `{prefix}/{workspace key}`
    pub fn branch_for(&self, item_id: &str) -> String {
        format!("{}/{}", self.branch_prefix, workspace_key(item_id))
    }

    /// Directory for an item: `{workspace_root}/{workspace key}`
    pub fn path_for(&self, item_id: &str) -> PathBuf {
        self.workspace_root.join(workspace_key(item_id))
    }

    /// Create (or adopt) the workspace for `item_id`
    pub fn acquire(&self, item_id: &str) -> Result<Workspace> {
        {
            let active = lock_mutex_recover(&self.active);
            if active.contains_key(item_id) {
                return Err(OrchestratorError::workspace(
                    item_id,
                    "a workspace for this item is already active",
                ));
            }
            // Never treat another item's live worktree as stale
            let branch = self.branch_for(item_id);
            let path = self.path_for(item_id);
            if let Some(owner) = active
                .values()
                .find(|w| w.branch == branch || same_dir(&w.path, &path))
            {
                return Err(OrchestratorError::workspace(
                    item_id,
                    format!("workspace {} is in use by {}", path.display(), owner.item_id),
                ));
            }
        }

        let workspace = match self.take_adoptable(item_id) {
            Some(workspace) => workspace,
            None => self.create(item_id)?,
        };

        lock_mutex_recover(&self.active).insert(item_id.to_string(), workspace.clone());
        Ok(workspace)
    }

    fn create(&self, item_id: &str) -> Result<Workspace> {
        let branch = self.branch_for(item_id);
        let path = self.path_for(item_id);

        let _git = lock_mutex_recover(&self.git_lock);
        let git = GitManager::new(&self.repo_path).map_err(|e| {
            OrchestratorError::ResourceExhaustion(format!("cannot open repository: {}", e))
        })?;

        if let Err(e) = git.prune_orphaned_worktrees() {
            log::warn!("[WorkspaceManager] Failed to prune orphaned worktrees: {}", e);
        }

        // Anything still sitting on our branch or directory is stale
        self.remove_stale(&git, &branch, &path)
            .map_err(|e| OrchestratorError::workspace(item_id, e))?;

        git.create_branch_from(&branch, &self.integration_branch, true)
            .map_err(|e| OrchestratorError::workspace(item_id, e))?;

        if let Err(e) = git.create_worktree(&branch, &path) {
            if let Err(cleanup) = git.delete_branch(&branch) {
                log::warn!(
                    "[WorkspaceManager] Failed to delete branch {} after failed worktree creation: {}",
                    branch,
                    cleanup
                );
            }
            return Err(OrchestratorError::workspace(item_id, e));
        }

        let base_commit = git
            .branch_tip(&branch)
            .map_err(|e| OrchestratorError::workspace(item_id, e))?;

        log::info!(
            "[WorkspaceManager] Created workspace for {} at {:?} on branch {}",
            item_id,
            path,
            branch
        );

        Ok(Workspace {
            item_id: item_id.to_string(),
            branch,
            path,
            base_commit,
            adopted: false,
        })
    }

    fn remove_stale(&self, git: &GitManager, branch: &str, path: &Path) -> std::io::Result<()> {
        match git.remove_worktree(path) {
            Ok(true) => log::warn!("[WorkspaceManager] Removed stale worktree at {:?}", path),
            Ok(false) => {}
            Err(e) => log::warn!("[WorkspaceManager] Failed to remove stale worktree: {}", e),
        }

        if path.exists() {
            log::warn!(
                "[WorkspaceManager] Removing unregistered directory at {:?}",
                path
            );
            std::fs::remove_dir_all(path)?;
        }

        if git.branch_exists(branch) {
            if let Err(e) = git.delete_branch(branch) {
                log::debug!(
                    "[WorkspaceManager] Stale branch {} couldn't be deleted: {}",
                    branch,
                    e
                );
            }
        }

        Ok(())
    }

    fn take_adoptable(&self, item_id: &str) -> Option<Workspace> {
        let key = workspace_key(item_id);
        let leftover = lock_mutex_recover(&self.adoptable).remove(&key)?;

        let branch = leftover.branch?;
        let path = leftover.path?;
        if branch != self.branch_for(item_id) || !path.exists() {
            return None;
        }

        let _git = lock_mutex_recover(&self.git_lock);
        let base_commit = GitManager::new(&self.repo_path)
            .and_then(|git| git.branch_tip(&self.integration_branch))
            .ok()?;

        log::info!(
            "[WorkspaceManager] Adopting leftover workspace for {} at {:?}",
            item_id,
            path
        );

        Some(Workspace {
            item_id: item_id.to_string(),
            branch,
            path,
            base_commit,
            adopted: true,
        })
    }

    /// Remove the workspace directory and its branch
    pub fn release(&self, workspace: &Workspace) -> Result<()> {
        lock_mutex_recover(&self.active).remove(&workspace.item_id);

        let _git = lock_mutex_recover(&self.git_lock);
        let git = GitManager::new(&self.repo_path)
            .map_err(|e| OrchestratorError::workspace(&workspace.item_id, e))?;

        if let Err(e) = git.remove_worktree(&workspace.path) {
            log::warn!(
                "[WorkspaceManager] Failed to remove worktree from git: {}",
                e
            );
        }

        if workspace.path.exists() {
            std::fs::remove_dir_all(&workspace.path)
                .map_err(|e| OrchestratorError::workspace(&workspace.item_id, e))?;
        }

        // Merged branches are reachable from the integration branch, unmerged
        // ones are discarded; either way the branch is no longer needed
        if git.branch_exists(&workspace.branch) {
            git.delete_branch(&workspace.branch)
                .map_err(|e| OrchestratorError::workspace(&workspace.item_id, e))?;
        }

        log::info!(
            "[WorkspaceManager] Released workspace for {} at {:?}",
            workspace.item_id,
            workspace.path
        );
        Ok(())
    }

    /// Release every active workspace (shutdown path)
    pub fn release_all(&self) -> usize {
        let workspaces: Vec<Workspace> = lock_mutex_recover(&self.active).values().cloned().collect();

        let mut released = 0;
        for workspace in workspaces {
            match self.release(&workspace) {
                Ok(()) => released += 1,
                Err(e) => log::warn!(
                    "[WorkspaceManager] Failed to release workspace for {}: {}",
                    workspace.item_id,
                    e
                ),
            }
        }
        released
    }

    pub fn active_count(&self) -> usize {
        lock_mutex_recover(&self.active).len()
    }

    /// Find worktrees, directories and branches left by a previous run
    pub fn scan_leftovers(&self) -> Result<Vec<LeftoverWorkspace>> {
        let _git = lock_mutex_recover(&self.git_lock);
        let git = GitManager::new(&self.repo_path)?;
        let prefix = format!("{}/", self.branch_prefix);

        let mut found: HashMap<String, LeftoverWorkspace> = HashMap::new();
        let active = lock_mutex_recover(&self.active);

        for worktree in git.list_worktrees()? {
            let path = PathBuf::from(&worktree.path);
            let under_root = path.parent().is_some_and(|p| same_dir(p, &self.workspace_root));
            let on_prefix = worktree
                .branch
                .as_deref()
                .is_some_and(|b| b.starts_with(&prefix));
            if !under_root && !on_prefix {
                continue;
            }

            let key = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let entry = found.entry(key.clone()).or_insert_with(|| LeftoverWorkspace {
                key,
                branch: None,
                path: None,
            });
            entry.path = Some(path);
            entry.branch = worktree.branch.filter(|b| b.starts_with(&prefix));
        }

        if self.workspace_root.exists() {
            for dir in std::fs::read_dir(&self.workspace_root)? {
                let path = dir?.path();
                if !path.is_dir() {
                    continue;
                }
                let key = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                found.entry(key.clone()).or_insert_with(|| LeftoverWorkspace {
                    key,
                    branch: None,
                    path: Some(path),
                });
            }
        }

        let claimed: Vec<String> = found.values().filter_map(|l| l.branch.clone()).collect();
        for branch in git.list_branches_with_prefix(&prefix)? {
            if claimed.contains(&branch.name) {
                continue;
            }
            let key = format!("branch:{}", branch.name);
            found.insert(
                key.clone(),
                LeftoverWorkspace {
                    key,
                    branch: Some(branch.name),
                    path: None,
                },
            );
        }

        let active_paths: Vec<&PathBuf> = active.values().map(|w| &w.path).collect();
        let mut leftovers: Vec<LeftoverWorkspace> = found
            .into_values()
            .filter(|l| {
                l.path
                    .as_ref()
                    .map_or(true, |p| !active_paths.iter().any(|a| same_dir(a, p)))
            })
            .collect();
        leftovers.sort_by(|a, b| a.key.cmp(&b.key));

        if !leftovers.is_empty() {
            log::info!(
                "[WorkspaceManager] Found {} leftover workspace(s) from a previous run",
                leftovers.len()
            );
        }
        Ok(leftovers)
    }

    /// Remove leftovers. Returns how many were removed cleanly.
    pub fn cleanup_leftovers(&self, leftovers: &[LeftoverWorkspace]) -> usize {
        let _git = lock_mutex_recover(&self.git_lock);
        let git = match GitManager::new(&self.repo_path) {
            Ok(git) => git,
            Err(e) => {
                log::warn!("[WorkspaceManager] Cannot open repository for cleanup: {}", e);
                return 0;
            }
        };

        let mut cleaned = 0;
        for leftover in leftovers {
            let mut ok = true;

            if let Some(path) = &leftover.path {
                if let Err(e) = git.remove_worktree(path) {
                    log::warn!("[WorkspaceManager] Failed to remove worktree {:?}: {}", path, e);
                }
                if path.exists() {
                    if let Err(e) = std::fs::remove_dir_all(path) {
                        log::warn!("[WorkspaceManager] Failed to remove {:?}: {}", path, e);
                        ok = false;
                    }
                }
            }

            if let Some(branch) = &leftover.branch {
                if git.branch_exists(branch) {
                    if let Err(e) = git.delete_branch(branch) {
                        log::warn!("[WorkspaceManager] Failed to delete branch {}: {}", branch, e);
                        ok = false;
                    }
                }
            }

            if ok {
                log::info!("[WorkspaceManager] Cleaned up leftover {}", leftover.key);
                cleaned += 1;
            }
        }

        if let Err(e) = git.prune_orphaned_worktrees() {
            log::warn!("[WorkspaceManager] Failed to prune orphaned worktrees: {}", e);
        }
        cleaned
    }

    /// Offer complete leftovers for adoption and clean up the rest.
    /// Returns the number of adoptable workspaces.
    pub fn adopt_leftovers(&self, leftovers: Vec<LeftoverWorkspace>) -> usize {
        let (complete, partial): (Vec<_>, Vec<_>) =
            leftovers.into_iter().partition(|l| l.is_complete());

        self.cleanup_leftovers(&partial);

        let count = complete.len();
        let mut adoptable = lock_mutex_recover(&self.adoptable);
        for leftover in complete {
            adoptable.insert(leftover.key.clone(), leftover);
        }
        count
    }

    /// Clean up adoptable leftovers that no item claimed
    pub fn discard_unadopted(&self) -> usize {
        let leftovers: Vec<LeftoverWorkspace> = lock_mutex_recover(&self.adoptable)
            .drain()
            .map(|(_, l)| l)
            .collect();
        self.cleanup_leftovers(&leftovers)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::test_support::{commit_all, init_repo};

    fn manager(repo: &Path) -> WorkspaceManager {
        WorkspaceManager::new(
            repo,
            &repo.join(".worktrees").join("issues"),
            "issue-orchestrator",
            "main",
            Arc::new(Mutex::new(())),
        )
        .unwrap()
    }

    #[test]
    fn test_names_are_derived_from_item_id() {
        let (_temp, repo) = init_repo();
        let manager = manager(&repo);

        let key = workspace_key("ISS-1.2");
        assert!(key.starts_with("iss-1-2-"));
        assert_eq!(key, workspace_key("ISS-1.2"));
        assert_eq!(manager.branch_for("ISS-1.2"), format!("issue-orchestrator/{}", key));
        assert_eq!(
            manager.path_for("ISS-1.2"),
            repo.join(".worktrees").join("issues").join(&key)
        );
    }

    #[test]
    fn test_ids_with_same_sanitized_form_get_separate_workspaces() {
        let (_temp, repo) = init_repo();
        let manager = manager(&repo);

        let dotted = manager.acquire("US-1.1").unwrap();
        std::fs::write(dotted.path.join("work.txt"), "in progress\n").unwrap();

        let underscored = manager.acquire("US-1_1").unwrap();
        let upper = manager.acquire("A").unwrap();
        let lower = manager.acquire("a").unwrap();

        assert_ne!(dotted.path, underscored.path);
        assert_ne!(dotted.branch, underscored.branch);
        assert_ne!(upper.path, lower.path);
        assert_ne!(upper.branch, lower.branch);
        assert_eq!(
            std::fs::read_to_string(dotted.path.join("work.txt")).unwrap(),
            "in progress\n"
        );
        assert_eq!(manager.active_count(), 4);
    }

    #[test]
    fn test_acquire_refuses_path_owned_by_active_item() {
        let (_temp, repo) = init_repo();
        let manager = manager(&repo);

        let live = manager.acquire("ISS-1").unwrap();
        std::fs::write(live.path.join("work.txt"), "in progress\n").unwrap();

        // Another id resolving to the same workspace, as a hash collision would
        let mut active = lock_mutex_recover(&manager.active);
        let mut alias = active.remove("ISS-1").unwrap();
        alias.item_id = "ISS-1-alias".to_string();
        active.insert(alias.item_id.clone(), alias);
        drop(active);

        assert!(manager.acquire("ISS-1").is_err());
        assert!(live.path.join("work.txt").exists());
    }

    #[test]
    fn test_acquire_and_release() {
        let (_temp, repo) = init_repo();
        let manager = manager(&repo);

        let workspace = manager.acquire("ISS-1").unwrap();
        assert!(workspace.path.join("README.md").exists());
        assert!(!workspace.adopted);
        assert_eq!(manager.active_count(), 1);

        let git = GitManager::new(&repo).unwrap();
        assert!(git.branch_exists(&workspace.branch));
        assert_eq!(workspace.base_commit, git.branch_tip("main").unwrap());

        // Exclusive ownership
        assert!(manager.acquire("ISS-1").is_err());

        manager.release(&workspace).unwrap();
        assert!(!workspace.path.exists());
        assert!(!git.branch_exists(&workspace.branch));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_fresh_workspace_starts_from_integration_tip() {
        let (_temp, repo) = init_repo();
        let manager = manager(&repo);

        let first = manager.acquire("ISS-1").unwrap();
        manager.release(&first).unwrap();

        std::fs::write(repo.join("new.txt"), "new\n").unwrap();
        let tip = commit_all(&repo, "Advance main");

        let second = manager.acquire("ISS-1").unwrap();
        assert_eq!(second.base_commit, tip);
        assert!(second.path.join("new.txt").exists());
    }

    #[test]
    fn test_acquire_replaces_stale_workspace() {
        let (_temp, repo) = init_repo();
        let manager = manager(&repo);

        let stale = manager.acquire("ISS-1").unwrap();
        std::fs::write(stale.path.join("junk.txt"), "junk").unwrap();
        // Forget it without releasing, as a crash would
        lock_mutex_recover(&manager.active).clear();

        let fresh = manager.acquire("ISS-1").unwrap();
        assert_eq!(fresh.path, stale.path);
        assert!(!fresh.path.join("junk.txt").exists());
    }

    #[test]
    fn test_scan_and_cleanup_leftovers() {
        let (_temp, repo) = init_repo();
        {
            let crashed = manager(&repo);
            crashed.acquire("ISS-1").unwrap();
            crashed.acquire("ISS-2").unwrap();
        }

        let manager = manager(&repo);
        let leftovers = manager.scan_leftovers().unwrap();
        assert_eq!(leftovers.len(), 2);
        assert!(leftovers.iter().all(|l| l.branch.is_some() && l.path.is_some()));

        assert_eq!(manager.cleanup_leftovers(&leftovers), 2);
        assert!(manager.scan_leftovers().unwrap().is_empty());

        let git = GitManager::new(&repo).unwrap();
        assert!(git
            .list_branches_with_prefix("issue-orchestrator/")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_adopt_leftover_workspace() {
        let (_temp, repo) = init_repo();
        let old_path = {
            let crashed = manager(&repo);
            let workspace = crashed.acquire("ISS-1").unwrap();
            std::fs::write(workspace.path.join("progress.txt"), "half done").unwrap();
            workspace.path
        };

        let manager = manager(&repo);
        let leftovers = manager.scan_leftovers().unwrap();
        assert_eq!(manager.adopt_leftovers(leftovers), 1);

        let adopted = manager.acquire("ISS-1").unwrap();
        assert!(adopted.adopted);
        assert_eq!(adopted.path, old_path);
        assert!(adopted.path.join("progress.txt").exists());

        // Adoption is single use
        manager.release(&adopted).unwrap();
        let fresh = manager.acquire("ISS-1").unwrap();
        assert!(!fresh.adopted);
    }
}
