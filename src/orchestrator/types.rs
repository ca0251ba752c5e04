//! Core types shared by the queue, workers and merge coordinator

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for blockers to complete
    Pending,
    /// All blockers completed, visible to workers
    Ready,
    /// Held by a worker (running or waiting for its merge turn)
    Assigned,
    /// Being integrated by the merge lane
    Merging,
    Completed,
    /// Permanently failed
    Failed,
    /// Returned to the queue, waiting out its backoff delay
    Requeued,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, ItemStatus::Assigned | ItemStatus::Merging)
    }
}

/// One unit of work with its dependencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    /// Higher tiers are released first
    pub priority: i32,
    /// Items that must complete before this one is ready
    pub blocked_by: BTreeSet<String>,
    /// Items this one blocks
    #[serde(default)]
    pub unblocks: BTreeSet<String>,
    pub status: ItemStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Reason of the most recent failed attempt
    #[serde(default)]
    pub last_error: Option<String>,
    /// Commit that integrated this item
    #[serde(default)]
    pub merge_commit: Option<String>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            blocked_by: BTreeSet::new(),
            unblocks: BTreeSet::new(),
            status: ItemStatus::Pending,
            retry_count: 0,
            last_error: None,
            merge_commit: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn blocked_by<I, S>(mut self, blockers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by.extend(blockers.into_iter().map(Into::into));
        self
    }
}

/// Output of one worker attempt, consumed exactly once by the merge coordinator
#[derive(Debug, Clone)]
pub struct WorkResult {
    pub item_id: String,
    pub success: bool,
    /// Workspace branch holding the attempt's commits
    pub branch: String,
    pub workspace_path: PathBuf,
    /// Opaque agent output, passed through for reporting
    pub diagnostic: String,
    pub elapsed: Duration,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Conflict,
    /// Rejected without integration (failed attempt or merge error)
    Aborted,
}

/// Result of integrating one [`WorkResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub item_id: String,
    pub status: MergeStatus,
    /// Integration tip after a successful merge
    pub commit_id: Option<String>,
    pub conflict_paths: Vec<String>,
    pub detail: String,
}

impl MergeOutcome {
    pub fn merged(item_id: &str, commit_id: String, detail: impl Into<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            status: MergeStatus::Merged,
            commit_id: Some(commit_id),
            conflict_paths: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn conflict(item_id: &str, paths: Vec<String>) -> Self {
        let detail = format!("conflict in {}", paths.join(", "));
        Self {
            item_id: item_id.to_string(),
            status: MergeStatus::Conflict,
            commit_id: None,
            conflict_paths: paths,
            detail,
        }
    }

    pub fn aborted(item_id: &str, detail: impl Into<String>) -> Self {
        Self {
            item_id: item_id.to_string(),
            status: MergeStatus::Aborted,
            commit_id: None,
            conflict_paths: Vec::new(),
            detail: detail.into(),
        }
    }

    pub fn is_merged(&self) -> bool {
        self.status == MergeStatus::Merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_item_builder() {
        let item = WorkItem::new("B").with_priority(2).blocked_by(["A"]);
        assert_eq!(item.priority, 2);
        assert!(item.blocked_by.contains("A"));
        assert_eq!(item.status, ItemStatus::Pending);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ItemStatus::Requeued).unwrap();
        assert_eq!(json, "\"requeued\"");
        assert!(ItemStatus::Merging.is_in_flight());
        assert!(ItemStatus::Failed.is_terminal());
    }

    #[test]
    fn test_conflict_outcome_detail() {
        let outcome = MergeOutcome::conflict("A", vec!["x.txt".to_string()]);
        assert_eq!(outcome.status, MergeStatus::Conflict);
        assert_eq!(outcome.detail, "conflict in x.txt");
        assert!(!outcome.is_merged());
    }
}
