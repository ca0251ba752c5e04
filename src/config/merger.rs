// Configuration merging with priority

use super::{BackoffConfig, LeftoverPolicy, OrchestratorConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Partial configuration for merging
/// Uses Option<T> for all fields to support partial overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<PartialRetry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_on_scope_conflict: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_wait_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leftover_policy: Option<LeftoverPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_agent_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dequeue_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartialRetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<PartialBackoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprioritize: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PartialBackoff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<bool>,
}

/// Configuration merger
/// Priority order: CLI -> Project -> Global -> Defaults
pub struct ConfigMerger {
    defaults: OrchestratorConfig,
    global: Option<PartialConfig>,
    project: Option<PartialConfig>,
    cli: Option<PartialConfig>,
}

impl ConfigMerger {
    /// Create a new config merger with defaults
    pub fn new() -> Self {
        Self {
            defaults: OrchestratorConfig::default(),
            global: None,
            project: None,
            cli: None,
        }
    }

    /// Set global config
    pub fn with_global(mut self, config: Option<PartialConfig>) -> Self {
        self.global = config;
        self
    }

    /// Set project config
    pub fn with_project(mut self, config: Option<PartialConfig>) -> Self {
        self.project = config;
        self
    }

    /// Set CLI overrides
    pub fn with_cli(mut self, config: Option<PartialConfig>) -> Self {
        self.cli = config;
        self
    }

    /// Merge all configs with priority
    pub fn merge(&self) -> OrchestratorConfig {
        [&self.global, &self.project, &self.cli]
            .into_iter()
            .flatten()
            .fold(self.defaults.clone(), |base, layer| {
                Self::merge_partial(&base, layer)
            })
    }

    /// Merge partial config into full config
    fn merge_partial(base: &OrchestratorConfig, partial: &PartialConfig) -> OrchestratorConfig {
        OrchestratorConfig {
            max_workers: partial.max_workers.unwrap_or(base.max_workers),
            item_timeout_secs: partial.item_timeout_secs.unwrap_or(base.item_timeout_secs),
            retry: partial
                .retry
                .as_ref()
                .map(|p| Self::merge_partial_retry(&base.retry, p))
                .unwrap_or_else(|| base.retry.clone()),
            scopes: partial
                .scopes
                .clone()
                .unwrap_or_else(|| base.scopes.clone()),
            queue_on_scope_conflict: partial
                .queue_on_scope_conflict
                .unwrap_or(base.queue_on_scope_conflict),
            scope_wait_timeout_secs: partial
                .scope_wait_timeout_secs
                .unwrap_or(base.scope_wait_timeout_secs),
            scope_poll_interval_ms: partial
                .scope_poll_interval_ms
                .unwrap_or(base.scope_poll_interval_ms),
            integration_branch: partial
                .integration_branch
                .clone()
                .or_else(|| base.integration_branch.clone()),
            workspace_root: partial
                .workspace_root
                .clone()
                .or_else(|| base.workspace_root.clone()),
            branch_prefix: partial
                .branch_prefix
                .clone()
                .unwrap_or_else(|| base.branch_prefix.clone()),
            lock_dir: partial.lock_dir.clone().or_else(|| base.lock_dir.clone()),
            state_dir: partial.state_dir.clone().or_else(|| base.state_dir.clone()),
            leftover_policy: partial.leftover_policy.unwrap_or(base.leftover_policy),
            commit_agent_changes: partial
                .commit_agent_changes
                .unwrap_or(base.commit_agent_changes),
            dequeue_timeout_ms: partial
                .dequeue_timeout_ms
                .unwrap_or(base.dequeue_timeout_ms),
        }
    }

    fn merge_partial_retry(base: &RetryConfig, partial: &PartialRetry) -> RetryConfig {
        RetryConfig {
            max_retries: partial.max_retries.unwrap_or(base.max_retries),
            backoff: partial
                .backoff
                .as_ref()
                .map(|p| Self::merge_partial_backoff(&base.backoff, p))
                .unwrap_or_else(|| base.backoff.clone()),
            deprioritize: partial.deprioritize.unwrap_or(base.deprioritize),
        }
    }

    fn merge_partial_backoff(base: &BackoffConfig, partial: &PartialBackoff) -> BackoffConfig {
        BackoffConfig {
            initial_ms: partial.initial_ms.unwrap_or(base.initial_ms),
            multiplier: partial.multiplier.unwrap_or(base.multiplier),
            max_ms: partial.max_ms.unwrap_or(base.max_ms),
            jitter: partial.jitter.unwrap_or(base.jitter),
        }
    }
}

impl Default for ConfigMerger {
    fn default() -> Self {
        Self::new()
    }
}
