//! Tests for GitManager
//!
//! Contains unit tests for the git primitives used by the orchestrator

#[cfg(test)]
mod tests {
    use crate::git::GitManager;
    use git2::{Repository, Signature};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn setup_test_repo() -> (TempDir, GitManager) {
        let temp_dir = TempDir::new().unwrap();
        let repo_path = temp_dir.path().join("repo");
        fs::create_dir_all(&repo_path).unwrap();

        let repo = Repository::init(&repo_path).unwrap();

        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            fs::write(repo_path.join("test.txt"), "Hello, World!\n").unwrap();
            index.add_path(Path::new("test.txt")).unwrap();
            index.write().unwrap();
            index.write_tree().unwrap()
        };

        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        let manager = GitManager::new(&repo_path).unwrap();
        (temp_dir, manager)
    }

    /// Create a worktree for `branch`, write `file` there and commit it
    fn commit_on_branch(
        manager: &GitManager,
        temp_dir: &TempDir,
        branch: &str,
        file: &str,
        content: &str,
    ) -> std::path::PathBuf {
        let base = manager.get_default_branch_name();
        manager.create_branch_from(branch, &base, false).unwrap();

        let wt_path = temp_dir.path().join(branch.replace('/', "_"));
        manager.create_worktree(branch, &wt_path).unwrap();

        fs::write(wt_path.join(file), content).unwrap();
        let wt = GitManager::new(&wt_path).unwrap();
        wt.commit_all(&format!("Change {}", file)).unwrap().unwrap();
        wt_path
    }

    #[test]
    fn test_create_git_manager() {
        let (_temp_dir, manager) = setup_test_repo();
        assert!(manager.repo_path().exists());
        assert!(manager.workdir().is_some());
    }

    #[test]
    fn test_create_branch_from_base_tip() {
        let (_temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();

        let branch = manager.create_branch_from("feature-test", &base, false).unwrap();
        assert_eq!(branch.name, "feature-test");
        assert!(!branch.is_head);
        assert_eq!(branch.commit_id, manager.branch_tip(&base).unwrap());
    }

    #[test]
    fn test_delete_branch() {
        let (_temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();

        manager.create_branch_from("to-delete", &base, false).unwrap();
        assert!(manager.branch_exists("to-delete"));

        manager.delete_branch("to-delete").unwrap();
        assert!(!manager.branch_exists("to-delete"));
    }

    #[test]
    fn test_list_branches_with_prefix() {
        let (_temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();

        manager.create_branch_from("orch/a", &base, false).unwrap();
        manager.create_branch_from("orch/b", &base, false).unwrap();
        manager.create_branch_from("other", &base, false).unwrap();

        let names: Vec<String> = manager
            .list_branches_with_prefix("orch/")
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"orch/a".to_string()));
        assert!(names.contains(&"orch/b".to_string()));
    }

    #[test]
    fn test_create_and_remove_worktree() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        manager.create_branch_from("orch/wt", &base, false).unwrap();

        let wt_path = temp_dir.path().join("wt");
        let info = manager.create_worktree("orch/wt", &wt_path).unwrap();

        assert_eq!(info.name, "orch-wt");
        assert_eq!(info.branch.as_deref(), Some("orch/wt"));
        assert!(wt_path.join("test.txt").exists());
        assert_eq!(manager.list_worktrees().unwrap().len(), 1);

        assert!(manager.remove_worktree(&wt_path).unwrap());
        assert!(!wt_path.exists());
        assert!(manager.list_worktrees().unwrap().is_empty());

        // Branch is no longer checked out anywhere, so it can be deleted
        manager.delete_branch("orch/wt").unwrap();
    }

    #[test]
    fn test_remove_unknown_worktree_reports_false() {
        let (temp_dir, manager) = setup_test_repo();
        let removed = manager
            .remove_worktree(&temp_dir.path().join("missing"))
            .unwrap();
        assert!(!removed);
    }

    #[test]
    fn test_commit_all_in_worktree() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        let wt_path = commit_on_branch(&manager, &temp_dir, "orch/commit", "new.txt", "new\n");

        let wt = GitManager::new(&wt_path).unwrap();
        assert!(!wt.has_uncommitted_changes().unwrap());
        assert!(wt.commit_all("nothing").unwrap().is_none());
        assert_eq!(manager.commits_ahead("orch/commit", &base).unwrap(), 1);
    }

    #[test]
    fn test_merge_fast_forward() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        commit_on_branch(&manager, &temp_dir, "orch/ff", "ff.txt", "ff\n");

        let result = manager.merge_branch("orch/ff", &base).unwrap();
        assert!(result.success);
        assert!(result.fast_forward);
        assert_eq!(
            result.commit_id.unwrap(),
            manager.branch_tip("orch/ff").unwrap()
        );
        // Target is checked out in the main working copy, so it follows the ref
        let workdir = manager.workdir().unwrap();
        assert!(workdir.join("ff.txt").exists());
        assert!(!manager.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn test_merge_three_way_clean() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        commit_on_branch(&manager, &temp_dir, "orch/a", "a.txt", "a\n");
        commit_on_branch(&manager, &temp_dir, "orch/b", "b.txt", "b\n");

        assert!(manager.merge_branch("orch/a", &base).unwrap().fast_forward);

        let result = manager.merge_branch("orch/b", &base).unwrap();
        assert!(result.success);
        assert!(!result.fast_forward);

        let oid = git2::Oid::from_str(&result.commit_id.unwrap()).unwrap();
        assert_eq!(manager.repo().find_commit(oid).unwrap().parent_count(), 2);
        let workdir = manager.workdir().unwrap();
        assert!(workdir.join("a.txt").exists());
        assert!(workdir.join("b.txt").exists());
        assert!(!manager.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn test_merge_conflict_leaves_target_untouched() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        commit_on_branch(&manager, &temp_dir, "orch/x", "test.txt", "from x\n");
        commit_on_branch(&manager, &temp_dir, "orch/y", "test.txt", "from y\n");

        manager.merge_branch("orch/x", &base).unwrap();
        let tip_before = manager.branch_tip(&base).unwrap();

        let result = manager.merge_branch("orch/y", &base).unwrap();
        assert!(!result.success);
        assert_eq!(result.conflict_files, vec!["test.txt".to_string()]);
        assert_eq!(manager.branch_tip(&base).unwrap(), tip_before);
        assert!(!manager.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn test_merge_up_to_date() {
        let (_temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        manager.create_branch_from("orch/noop", &base, false).unwrap();

        let result = manager.merge_branch("orch/noop", &base).unwrap();
        assert!(result.success);
        assert_eq!(result.message, "Already up to date");
        assert_eq!(result.commit_id.unwrap(), manager.branch_tip(&base).unwrap());
    }

    #[test]
    fn test_merge_keeps_checked_out_index_in_step() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        commit_on_branch(&manager, &temp_dir, "orch/new", "new.txt", "new\n");

        manager.merge_branch("orch/new", &base).unwrap();

        let repo = Repository::open(manager.repo_path()).unwrap();
        assert!(repo.status_file(Path::new("new.txt")).unwrap().is_empty());
        let head_tree = repo.head().unwrap().peel_to_tree().unwrap();
        assert!(head_tree.get_path(Path::new("new.txt")).is_ok());
        assert_eq!(
            fs::read_to_string(manager.workdir().unwrap().join("new.txt")).unwrap(),
            "new\n"
        );
    }

    #[test]
    fn test_merge_refuses_to_clobber_local_edits() {
        let (temp_dir, manager) = setup_test_repo();
        let base = manager.get_default_branch_name();
        commit_on_branch(&manager, &temp_dir, "orch/edit", "test.txt", "from branch\n");
        let tip_before = manager.branch_tip(&base).unwrap();

        let local = manager.workdir().unwrap().join("test.txt");
        fs::write(&local, "local edit\n").unwrap();

        assert!(manager.merge_branch("orch/edit", &base).is_err());
        assert_eq!(manager.branch_tip(&base).unwrap(), tip_before);
        assert_eq!(fs::read_to_string(&local).unwrap(), "local edit\n");
    }
}
