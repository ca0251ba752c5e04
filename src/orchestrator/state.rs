//! Durable run state
//!
//! The whole run is snapshotted after every state-changing event so a crashed
//! run can be resumed by a fresh process.

use super::queue::WorkQueue;
use super::types::{ItemStatus, WorkItem};
use crate::error::{OrchestratorError, Result};
use crate::file_storage::{read_json, write_json};
use crate::utils::lock_mutex_recover;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const LATEST_POINTER: &str = "latest";

/// Snapshot of one orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorState {
    pub run_id: String,
    pub integration_branch: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Every item with its status and retry count, in insertion order
    pub items: Vec<WorkItem>,
    /// Items assigned to a worker or being merged
    pub active_assignments: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Set once the run terminated normally
    #[serde(default)]
    pub finished: bool,
}

impl OrchestratorState {
    pub fn from_items(
        run_id: &str,
        integration_branch: &str,
        started_at: DateTime<Utc>,
        items: Vec<WorkItem>,
    ) -> Self {
        let ids_with = |pred: fn(&ItemStatus) -> bool| -> Vec<String> {
            items
                .iter()
                .filter(|item| pred(&item.status))
                .map(|item| item.id.clone())
                .collect()
        };

        let active_assignments = ids_with(ItemStatus::is_in_flight);
        let completed = ids_with(|s| *s == ItemStatus::Completed);
        let failed = ids_with(|s| *s == ItemStatus::Failed);

        Self {
            run_id: run_id.to_string(),
            integration_branch: integration_branch.to_string(),
            started_at,
            updated_at: Utc::now(),
            items,
            active_assignments,
            completed,
            failed,
            finished: false,
        }
    }

    /// Items to seed a resumed run with.
    ///
    /// Completed and failed items keep their status. Everything else starts
    /// over from pending with its retry count preserved, since in-flight
    /// workspaces do not survive the process.
    pub fn resume_items(&self) -> Vec<WorkItem> {
        self.items
            .iter()
            .cloned()
            .map(|mut item| {
                if !item.status.is_terminal() {
                    item.status = ItemStatus::Pending;
                }
                item
            })
            .collect()
    }
}

/// Storage for run snapshots
pub trait StateStore: Send + Sync {
    fn save(&self, state: &OrchestratorState) -> Result<()>;

    fn load(&self, run_id: &str) -> Result<Option<OrchestratorState>>;

    /// Run id of the most recently saved run
    fn latest_run_id(&self) -> Result<Option<String>>;
}

/// One pretty-printed JSON file per run, `<dir>/<run_id>.json`, plus a `latest` pointer
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }
}

impl StateStore for JsonStateStore {
    fn save(&self, state: &OrchestratorState) -> Result<()> {
        write_json(&self.state_path(&state.run_id), state).map_err(OrchestratorError::State)?;
        crate::file_storage::atomic_write(&self.dir.join(LATEST_POINTER), &state.run_id)
            .map_err(OrchestratorError::State)
    }

    fn load(&self, run_id: &str) -> Result<Option<OrchestratorState>> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some).map_err(OrchestratorError::State)
    }

    fn latest_run_id(&self) -> Result<Option<String>> {
        let pointer = self.dir.join(LATEST_POINTER);
        if !pointer.exists() {
            return Ok(None);
        }
        let run_id = std::fs::read_to_string(&pointer)?.trim().to_string();
        Ok((!run_id.is_empty()).then_some(run_id))
    }
}

/// Persists the queue after every event of a run
pub struct ProgressRecorder {
    queue: Arc<WorkQueue>,
    store: Arc<dyn StateStore>,
    run_id: String,
    integration_branch: String,
    started_at: DateTime<Utc>,
    /// Serializes snapshot + write so an older snapshot never overwrites a newer one
    write_lock: Mutex<()>,
}

impl ProgressRecorder {
    pub fn new(
        queue: Arc<WorkQueue>,
        store: Arc<dyn StateStore>,
        run_id: &str,
        integration_branch: &str,
    ) -> Self {
        Self::resumed(queue, store, run_id, integration_branch, Utc::now())
    }

    /// Recorder for a resumed run, keeping the original start time
    pub fn resumed(
        queue: Arc<WorkQueue>,
        store: Arc<dyn StateStore>,
        run_id: &str,
        integration_branch: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            queue,
            store,
            run_id: run_id.to_string(),
            integration_branch: integration_branch.to_string(),
            started_at,
            write_lock: Mutex::new(()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn snapshot(&self) -> OrchestratorState {
        OrchestratorState::from_items(
            &self.run_id,
            &self.integration_branch,
            self.started_at,
            self.queue.snapshot(),
        )
    }

    /// Write a snapshot, propagating storage errors
    pub fn save(&self, finished: bool) -> Result<OrchestratorState> {
        let _guard = lock_mutex_recover(&self.write_lock);
        let mut state = self.snapshot();
        state.finished = finished;
        self.store.save(&state)?;
        Ok(state)
    }

    /// Write a snapshot after an event; failures are logged and the run goes on
    pub fn persist(&self) {
        if let Err(e) = self.save(false) {
            log::error!(
                "[Orchestrator] Failed to persist state of run {}: {}",
                self.run_id,
                e
            );
        }
    }
}
