//! Orchestrator configuration
//!
//! Typed configuration with defaults enumerated once in `Default`, read from
//! `config.yaml` files and layered with CLI overrides by [`ConfigMerger`].

mod merger;

pub use merger::{ConfigMerger, PartialBackoff, PartialConfig, PartialRetry};

use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory (relative to the repository root) holding project-level files
pub const PROJECT_DIR: &str = ".issue-orchestrator";

/// What to do with workspaces left behind by a crashed run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeftoverPolicy {
    /// Remove leftover worktrees and branches before new work starts
    #[default]
    Cleanup,
    /// Hand a leftover workspace to the next attempt of its issue
    Adopt,
}

/// Backoff curve applied before a requeued item becomes visible again
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_ms: u64,
    /// Growth factor per subsequent retry
    pub multiplier: f64,
    /// Upper bound for the delay
    pub max_ms: u64,
    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 0,
            multiplier: 2.0,
            max_ms: 60_000,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retry` (1-based) becomes visible
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.initial_ms == 0 || retry == 0 {
            return Duration::ZERO;
        }

        let exponent = (retry - 1).min(32) as i32;
        let raw = self.initial_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_ms as f64).max(0.0);

        let with_jitter = if self.jitter {
            use rand::Rng;
            capped + capped * rand::thread_rng().gen_range(0.0..0.25)
        } else {
            capped
        };

        Duration::from_millis(with_jitter as u64)
    }
}

/// Requeue policy for failed attempts and merge conflicts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// An item fails permanently when its retry counter reaches this bound
    pub max_retries: u32,
    /// Delay curve for requeued items
    pub backoff: BackoffConfig,
    /// Move requeued items to the back of their priority tier
    pub deprioritize: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffConfig::default(),
            deprioritize: true,
        }
    }
}

/// Full orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Number of concurrent workers
    pub max_workers: usize,
    /// Bound for one agent run, in seconds
    pub item_timeout_secs: u64,
    /// Requeue policy
    pub retry: RetryConfig,
    /// Path-glob scopes claimed for the run (empty = whole repository)
    pub scopes: Vec<String>,
    /// Wait for conflicting scope holders instead of failing immediately
    pub queue_on_scope_conflict: bool,
    /// Bound for that wait, in seconds
    pub scope_wait_timeout_secs: u64,
    /// Poll interval while waiting for a scope, in milliseconds
    pub scope_poll_interval_ms: u64,
    /// Shared branch results are merged into (default: repository HEAD branch)
    pub integration_branch: Option<String>,
    /// Directory holding per-issue worktrees
    pub workspace_root: Option<PathBuf>,
    /// Prefix for per-issue branches
    pub branch_prefix: String,
    /// Directory holding scope lock records
    pub lock_dir: Option<PathBuf>,
    /// Directory holding persisted run state
    pub state_dir: Option<PathBuf>,
    /// Handling of workspaces left by a crashed run
    pub leftover_policy: LeftoverPolicy,
    /// Commit uncommitted agent output before merging
    pub commit_agent_changes: bool,
    /// Worker dequeue timeout between drain checks, in milliseconds
    pub dequeue_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            item_timeout_secs: 1800,
            retry: RetryConfig::default(),
            scopes: Vec::new(),
            queue_on_scope_conflict: false,
            scope_wait_timeout_secs: 600,
            scope_poll_interval_ms: 500,
            integration_branch: None,
            workspace_root: None,
            branch_prefix: "issue-orchestrator".to_string(),
            lock_dir: None,
            state_dir: None,
            leftover_policy: LeftoverPolicy::Cleanup,
            commit_agent_changes: true,
            dequeue_timeout_ms: 250,
        }
    }
}

impl OrchestratorConfig {
    /// Reject values the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(OrchestratorError::Config(
                "maxWorkers must be at least 1".to_string(),
            ));
        }
        if self.item_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "itemTimeoutSecs must be at least 1".to_string(),
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(OrchestratorError::Config(
                "retry.maxRetries must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff.multiplier < 1.0 {
            return Err(OrchestratorError::Config(
                "retry.backoff.multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.branch_prefix.trim_matches('/').is_empty() {
            return Err(OrchestratorError::Config(
                "branchPrefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }

    pub fn scope_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.scope_wait_timeout_secs)
    }

    pub fn scope_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scope_poll_interval_ms.max(1))
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms.max(1))
    }

    /// Scopes claimed by the run; an empty list claims the whole repository
    pub fn effective_scopes(&self) -> Vec<String> {
        if self.scopes.is_empty() {
            vec!["**".to_string()]
        } else {
            self.scopes.clone()
        }
    }

    pub fn workspace_root_for(&self, repo_root: &Path) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| repo_root.join(".worktrees").join("issues"))
    }

    /// Lock records live in the repository's git directory, outside every worktree
    pub fn lock_dir_for(&self, git_dir: &Path) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| git_dir.join("issue-orchestrator").join("locks"))
    }

    pub fn state_dir_for(&self, repo_root: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| repo_root.join(PROJECT_DIR).join("runs"))
    }
}

/// Configuration file manager
///
/// Reads `config.yaml` files holding partial configuration.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Config manager for a project's `.issue-orchestrator/config.yaml`
    pub fn for_project(project_path: &Path) -> Self {
        Self {
            config_path: project_path.join(PROJECT_DIR).join("config.yaml"),
        }
    }

    /// Config manager for `~/.issue-orchestrator/config.yaml`
    pub fn global() -> Option<Self> {
        dirs::home_dir().map(|home| Self {
            config_path: home.join(PROJECT_DIR).join("config.yaml"),
        })
    }

    /// Config manager for an explicit file
    pub fn at(path: &Path) -> Self {
        Self {
            config_path: path.to_path_buf(),
        }
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Read the config file, `None` when it does not exist
    pub fn read(&self) -> Result<Option<PartialConfig>> {
        if !self.config_path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&self.config_path)?;

        serde_yaml::from_str(&content).map(Some).map_err(|e| {
            OrchestratorError::Config(format!(
                "Failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })
    }

    /// Write a partial config to the file
    pub fn write(&self, config: &PartialConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(config)
            .map_err(|e| OrchestratorError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

/// Load defaults, then the global file, then the project file, then `cli`
pub fn load_config(project_path: &Path, cli: PartialConfig) -> Result<OrchestratorConfig> {
    let global = match ConfigManager::global() {
        Some(manager) => manager.read()?,
        None => None,
    };
    let project = ConfigManager::for_project(project_path).read()?;

    let config = ConfigMerger::new()
        .with_global(global)
        .with_project(project)
        .with_cli(Some(cli))
        .merge();

    config.validate()?;
    Ok(config)
}
