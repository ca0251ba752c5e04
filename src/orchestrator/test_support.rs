//! Repository fixtures for orchestrator unit tests

use git2::{Repository, Signature};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Fresh repository with one commit on `main`, inside `temp/repo`
pub(crate) fn init_repo() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path().join("repo");
    fs::create_dir_all(&repo_path).unwrap();

    let repo = Repository::init(&repo_path).unwrap();
    repo.set_head("refs/heads/main").unwrap();

    fs::write(repo_path.join("README.md"), "# test\n").unwrap();
    fs::write(repo_path.join("shared.txt"), "line 1\nline 2\nline 3\n").unwrap();
    commit_all(&repo_path, "Initial commit");

    (temp_dir, repo_path)
}

/// Stage everything in `path` and commit it on HEAD
pub(crate) fn commit_all(path: &Path, message: &str) -> String {
    let repo = Repository::open(path).unwrap();
    let sig = Signature::now("Test User", "test@example.com").unwrap();

    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();

    let parents: Vec<git2::Commit> = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .into_iter()
        .collect();
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
        .to_string()
}

/// Content of `file` at the tip of `branch`
pub(crate) fn file_at_branch(repo_path: &Path, branch: &str, file: &str) -> Option<String> {
    let repo = Repository::open(repo_path).unwrap();
    let tree = repo
        .find_branch(branch, git2::BranchType::Local)
        .ok()?
        .get()
        .peel_to_tree()
        .ok()?;
    let entry = tree.get_path(Path::new(file)).ok()?;
    let blob = repo.find_blob(entry.id()).ok()?;
    Some(String::from_utf8_lossy(blob.content()).to_string())
}
