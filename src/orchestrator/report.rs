//! Final run report

use super::types::{ItemStatus, WorkItem};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

/// Exit code of a run where every item completed
pub const EXIT_OK: i32 = 0;
/// Exit code of a run with failed or blocked items
pub const EXIT_ITEMS_FAILED: i32 = 1;
/// Exit code of a run that could not start or was aborted
pub const EXIT_FATAL: i32 = 2;
/// Exit code of a run stopped by a signal
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedEntry {
    pub id: String,
    pub commit: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub id: String,
    pub reason: String,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedEntry {
    pub id: String,
    /// Direct blockers that never completed
    pub waiting_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptedEntry {
    pub id: String,
    pub status: ItemStatus,
    pub retries: u32,
}

/// Completed, failed, blocked and interrupted items of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub integration_branch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed: Vec<CompletedEntry>,
    pub failed: Vec<FailedEntry>,
    pub blocked: Vec<BlockedEntry>,
    pub interrupted: Vec<InterruptedEntry>,
    /// The run stopped because shutdown was requested
    pub shutdown_requested: bool,
}

impl RunReport {
    pub fn from_items(
        run_id: &str,
        integration_branch: &str,
        started_at: DateTime<Utc>,
        items: &[WorkItem],
        shutdown_requested: bool,
    ) -> Self {
        let by_id: HashMap<&str, &WorkItem> =
            items.iter().map(|item| (item.id.as_str(), item)).collect();
        let mut doomed: HashMap<&str, bool> = HashMap::new();

        let mut report = Self {
            run_id: run_id.to_string(),
            integration_branch: integration_branch.to_string(),
            started_at,
            finished_at: Utc::now(),
            completed: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            interrupted: Vec::new(),
            shutdown_requested,
        };

        for item in items {
            match item.status {
                ItemStatus::Completed => report.completed.push(CompletedEntry {
                    id: item.id.clone(),
                    commit: item.merge_commit.clone(),
                    retries: item.retry_count,
                }),
                ItemStatus::Failed => report.failed.push(FailedEntry {
                    id: item.id.clone(),
                    reason: item
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "unknown failure".to_string()),
                    retries: item.retry_count,
                }),
                ItemStatus::Pending
                    if !shutdown_requested || is_doomed(&item.id, &by_id, &mut doomed) =>
                {
                    report.blocked.push(BlockedEntry {
                        id: item.id.clone(),
                        waiting_on: item
                            .blocked_by
                            .iter()
                            .filter(|b| {
                                by_id
                                    .get(b.as_str())
                                    .map_or(true, |i| i.status != ItemStatus::Completed)
                            })
                            .cloned()
                            .collect(),
                    })
                }
                status => report.interrupted.push(InterruptedEntry {
                    id: item.id.clone(),
                    status,
                    retries: item.retry_count,
                }),
            }
        }

        report
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
            && self.blocked.is_empty()
            && self.interrupted.is_empty()
            && !self.shutdown_requested
    }

    pub fn exit_code(&self) -> i32 {
        if self.shutdown_requested {
            EXIT_INTERRUPTED
        } else if !self.failed.is_empty() || !self.blocked.is_empty() {
            EXIT_ITEMS_FAILED
        } else {
            EXIT_OK
        }
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "Run {}: {} completed, {} failed, {} blocked",
            self.run_id,
            self.completed.len(),
            self.failed.len(),
            self.blocked.len()
        );
        if !self.interrupted.is_empty() || self.shutdown_requested {
            let _ = write!(line, ", {} interrupted", self.interrupted.len());
        }
        line
    }

    /// Human-readable report
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.summary_line());
        let _ = writeln!(out, "Integration branch: {}", self.integration_branch);

        if !self.completed.is_empty() {
            let _ = writeln!(out, "\nCompleted:");
            for entry in &self.completed {
                let commit = entry
                    .commit
                    .as_deref()
                    .map(|c| &c[..c.len().min(10)])
                    .unwrap_or("-");
                let _ = writeln!(out, "  {} ({})", entry.id, commit);
            }
        }

        if !self.failed.is_empty() {
            let _ = writeln!(out, "\nFailed:");
            for entry in &self.failed {
                let _ = writeln!(
                    out,
                    "  {} after {} retries: {}",
                    entry.id, entry.retries, entry.reason
                );
            }
        }

        if !self.blocked.is_empty() {
            let _ = writeln!(out, "\nBlocked:");
            for entry in &self.blocked {
                let _ = writeln!(
                    out,
                    "  {} waiting on {}",
                    entry.id,
                    entry.waiting_on.join(", ")
                );
            }
        }

        if !self.interrupted.is_empty() {
            let _ = writeln!(out, "\nInterrupted (resume with --resume {}):", self.run_id);
            for entry in &self.interrupted {
                let _ = writeln!(out, "  {} ({:?})", entry.id, entry.status);
            }
        }

        out
    }
}

/// Whether a pending item can never run because a transitive blocker failed
fn is_doomed<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a WorkItem>,
    memo: &mut HashMap<&'a str, bool>,
) -> bool {
    if let Some(&known) = memo.get(id) {
        return known;
    }
    // Graphs are acyclic; the placeholder only guards against malformed input
    memo.insert(id, false);

    let doomed = by_id.get(id).is_some_and(|item| {
        item.blocked_by.iter().any(|blocker| match by_id.get(blocker.as_str()) {
            Some(b) if b.status == ItemStatus::Failed => true,
            Some(b) if b.status == ItemStatus::Pending => is_doomed(b.id.as_str(), by_id, memo),
            _ => false,
        })
    });

    memo.insert(id, doomed);
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, status: ItemStatus, blocked_by: &[&str]) -> WorkItem {
        let mut item = WorkItem::new(id).blocked_by(blocked_by.iter().copied());
        item.status = status;
        item
    }

    #[test]
    fn test_successful_run() {
        let mut done = item("A", ItemStatus::Completed, &[]);
        done.merge_commit = Some("0123456789abcdef".to_string());

        let report = RunReport::from_items("run-1", "main", Utc::now(), &[done], false);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), EXIT_OK);
        assert!(report.render_text().contains("A (0123456789)"));
    }

    #[test]
    fn test_failed_item_blocks_dependents() {
        let mut failed = item("A", ItemStatus::Failed, &[]);
        failed.last_error = Some("Issue A exhausted its 3 retries".to_string());
        failed.retry_count = 3;

        let items = vec![
            failed,
            item("B", ItemStatus::Pending, &["A"]),
            item("C", ItemStatus::Pending, &["B"]),
        ];
        let report = RunReport::from_items("run-1", "main", Utc::now(), &items, false);

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].retries, 3);
        assert_eq!(
            report.blocked,
            vec![
                BlockedEntry {
                    id: "B".to_string(),
                    waiting_on: vec!["A".to_string()]
                },
                BlockedEntry {
                    id: "C".to_string(),
                    waiting_on: vec!["B".to_string()]
                },
            ]
        );
        assert_eq!(report.exit_code(), EXIT_ITEMS_FAILED);
    }

    #[test]
    fn test_interrupted_run() {
        let items = vec![
            item("A", ItemStatus::Failed, &[]),
            item("B", ItemStatus::Pending, &["A"]),
            item("C", ItemStatus::Assigned, &[]),
            item("D", ItemStatus::Pending, &["C"]),
        ];
        let report = RunReport::from_items("run-1", "main", Utc::now(), &items, true);

        assert_eq!(report.blocked.len(), 1);
        assert_eq!(report.blocked[0].id, "B");
        let interrupted: Vec<&str> = report.interrupted.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(interrupted, vec!["C", "D"]);
        assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
        assert!(report.summary_line().ends_with("2 interrupted"));
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let report = RunReport::from_items("run-1", "main", Utc::now(), &[], false);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["runId"], "run-1");
        assert!(json["shutdownRequested"].is_boolean());
    }
}
