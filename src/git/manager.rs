//! Core GitManager implementation
//!
//! Contains the GitManager struct and its basic operations

use git2::{Error as GitError, Repository, Signature};
use std::path::{Path, PathBuf};

/// Fallback identity used when the repository has no `user.name`/`user.email`
const FALLBACK_NAME: &str = "Issue Orchestrator";
const FALLBACK_EMAIL: &str = "orchestrator@localhost";

/// Git manager for repository operations
///
/// `git2::Repository` is not `Sync`, so callers open a fresh manager per
/// operation instead of sharing one across threads.
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Create a new GitManager for the given repository (or worktree) path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the repository path (the `.git` directory)
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Get the working directory, if the repository is not bare
    pub fn workdir(&self) -> Option<PathBuf> {
        self.repo.workdir().map(|p| p.to_path_buf())
    }

    /// Get a reference to the underlying repository
    pub(crate) fn repo(&self) -> &Repository {
        &self.repo
    }

    /// Signature for commits created by the orchestrator
    pub(crate) fn signature(&self) -> Result<Signature<'static>, GitError> {
        self.repo
            .signature()
            .or_else(|_| Signature::now(FALLBACK_NAME, FALLBACK_EMAIL))
    }
}
