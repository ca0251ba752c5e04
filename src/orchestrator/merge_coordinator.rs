//! Merge Coordinator
//!
//! A single lane task integrates worker results into the integration branch
//! one at a time, in submission order. Every submitted result ends with its
//! workspace destroyed and its item either completed or requeued.

use super::queue::{RequeueOutcome, WorkQueue};
use super::state::ProgressRecorder;
use super::types::{MergeOutcome, WorkResult};
use super::workspace::{Workspace, WorkspaceManager};
use crate::error::{OrchestratorError, Result};
use crate::git::GitManager;
use crate::utils::lock_mutex_recover;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct MergeRequest {
    result: WorkResult,
    workspace: Workspace,
    reply: oneshot::Sender<MergeOutcome>,
}

/// Everything the lane needs to integrate and settle one result
#[derive(Clone)]
struct MergeLane {
    repo_path: PathBuf,
    integration_branch: String,
    git_lock: Arc<Mutex<()>>,
    queue: Arc<WorkQueue>,
    workspaces: Arc<WorkspaceManager>,
    recorder: Arc<ProgressRecorder>,
}

impl MergeLane {
    async fn process(&self, result: &WorkResult, workspace: Workspace) -> MergeOutcome {
        if !self.queue.mark_merging(&result.item_id) {
            log::warn!(
                "[MergeCoordinator] {} was not assigned when its merge turn came",
                result.item_id
            );
        }
        self.recorder.persist();

        let lane = self.clone();
        let item_id = result.item_id.clone();
        let branch = result.branch.clone();
        let outcome = tokio::task::spawn_blocking(move || lane.merge_blocking(&item_id, &branch))
            .await
            .unwrap_or_else(|e| {
                MergeOutcome::aborted(&result.item_id, format!("merge task failed: {}", e))
            });

        self.settle(workspace, &outcome).await;
        outcome
    }

    fn merge_blocking(&self, item_id: &str, branch: &str) -> MergeOutcome {
        let _git = lock_mutex_recover(&self.git_lock);

        let git = match GitManager::new(&self.repo_path) {
            Ok(git) => git,
            Err(e) => {
                return MergeOutcome::aborted(item_id, format!("cannot open repository: {}", e))
            }
        };

        match git.commits_ahead(branch, &self.integration_branch) {
            Ok(ahead) => log::info!(
                "[MergeCoordinator] Merging {} from branch {} ({} commits)",
                item_id,
                branch,
                ahead
            ),
            Err(e) => log::warn!(
                "[MergeCoordinator] Cannot count commits on {}: {}",
                branch,
                e
            ),
        }

        match git.merge_branch(branch, &self.integration_branch) {
            Ok(merge) if merge.success => {
                let commit_id = merge.commit_id.unwrap_or_default();
                log::info!(
                    "[MergeCoordinator] Merged {} into {} at {}: {}",
                    item_id,
                    self.integration_branch,
                    commit_id,
                    merge.message
                );
                MergeOutcome::merged(item_id, commit_id, merge.message)
            }
            Ok(merge) if !merge.conflict_files.is_empty() => {
                log::warn!(
                    "[MergeCoordinator] Conflict detected for {}: {:?}",
                    item_id,
                    merge.conflict_files
                );
                MergeOutcome::conflict(item_id, merge.conflict_files)
            }
            Ok(merge) => {
                log::error!(
                    "[MergeCoordinator] Merge failed for {}: {}",
                    item_id,
                    merge.message
                );
                MergeOutcome::aborted(item_id, merge.message)
            }
            Err(e) => {
                log::error!("[MergeCoordinator] Merge failed for {}: {}", item_id, e);
                MergeOutcome::aborted(item_id, format!("merge failed: {}", e))
            }
        }
    }

    /// Destroy the workspace, then complete or requeue the item
    async fn settle(&self, workspace: Workspace, outcome: &MergeOutcome) {
        let workspaces = self.workspaces.clone();
        let released = tokio::task::spawn_blocking(move || workspaces.release(&workspace)).await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!(
                "[MergeCoordinator] Failed to destroy workspace of {}: {}",
                outcome.item_id,
                e
            ),
            Err(e) => log::warn!(
                "[MergeCoordinator] Workspace cleanup task for {} failed: {}",
                outcome.item_id,
                e
            ),
        }

        if outcome.is_merged() {
            self.queue
                .mark_completed(&outcome.item_id, outcome.commit_id.clone());
        } else {
            let reason = match outcome.status {
                super::types::MergeStatus::Conflict => OrchestratorError::MergeConflict {
                    item_id: outcome.item_id.clone(),
                    paths: outcome.conflict_paths.clone(),
                }
                .to_string(),
                _ => outcome.detail.clone(),
            };
            if let RequeueOutcome::Exhausted { retries } =
                self.queue.requeue(&outcome.item_id, &reason)
            {
                log::warn!(
                    "[MergeCoordinator] {}",
                    OrchestratorError::RetryExhausted {
                        item_id: outcome.item_id.clone(),
                        retries,
                    }
                );
            }
        }

        self.recorder.persist();
    }
}

/// Handle to the serialized merge lane
pub struct MergeCoordinator {
    sender: Mutex<Option<mpsc::Sender<MergeRequest>>>,
    lane_task: Mutex<Option<JoinHandle<()>>>,
    lane: MergeLane,
}

impl MergeCoordinator {
    /// Start the merge lane. Must be called inside a tokio runtime.
    pub fn start(
        repo_path: PathBuf,
        integration_branch: String,
        git_lock: Arc<Mutex<()>>,
        queue: Arc<WorkQueue>,
        workspaces: Arc<WorkspaceManager>,
        recorder: Arc<ProgressRecorder>,
        capacity: usize,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            OrchestratorError::ResourceExhaustion(format!("cannot start merge lane: {}", e))
        })?;

        let lane = MergeLane {
            repo_path,
            integration_branch,
            git_lock,
            queue,
            workspaces,
            recorder,
        };

        let (sender, mut receiver) = mpsc::channel::<MergeRequest>(capacity.max(1));
        let worker_lane = lane.clone();
        let lane_task = runtime.spawn(async move {
            while let Some(request) = receiver.recv().await {
                let outcome = worker_lane
                    .process(&request.result, request.workspace)
                    .await;
                if request.reply.send(outcome).is_err() {
                    log::debug!(
                        "[MergeCoordinator] Submitter of {} went away before its outcome",
                        request.result.item_id
                    );
                }
            }
            log::debug!("[MergeCoordinator] Merge lane stopped");
        });

        log::info!(
            "[MergeCoordinator] Merge lane started for {}",
            lane.integration_branch
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            lane_task: Mutex::new(Some(lane_task)),
            lane,
        })
    }

    pub fn integration_branch(&self) -> &str {
        &self.lane.integration_branch
    }

    /// Hand a result and its workspace to the coordinator and wait for the outcome.
    ///
    /// Failed results are rejected without entering the lane. Successful results
    /// wait for their turn; results are merged in the order they were submitted.
    pub async fn submit(&self, result: WorkResult, workspace: Workspace) -> Result<MergeOutcome> {
        if !result.success {
            let detail = if result.timed_out {
                result.diagnostic.clone()
            } else {
                format!("agent failed: {}", result.diagnostic)
            };
            log::info!(
                "[MergeCoordinator] Rejecting failed result for {}",
                result.item_id
            );
            let outcome = MergeOutcome::aborted(&result.item_id, detail);
            self.lane.settle(workspace, &outcome).await;
            return Ok(outcome);
        }

        let sender = lock_mutex_recover(&self.sender).clone().ok_or_else(|| {
            OrchestratorError::ResourceExhaustion("merge lane is closed".to_string())
        })?;

        let (reply, receive) = oneshot::channel();
        let item_id = result.item_id.clone();
        sender
            .send(MergeRequest {
                result,
                workspace,
                reply,
            })
            .await
            .map_err(|_| {
                OrchestratorError::ResourceExhaustion(format!(
                    "merge lane stopped before accepting {}",
                    item_id
                ))
            })?;

        receive.await.map_err(|_| {
            OrchestratorError::ResourceExhaustion(format!(
                "merge lane stopped before merging {}",
                item_id
            ))
        })
    }

    /// Stop accepting results and wait for the lane to finish queued merges
    pub async fn close(&self) {
        lock_mutex_recover(&self.sender).take();
        let task = lock_mutex_recover(&self.lane_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("[MergeCoordinator] Merge lane panicked: {}", e);
            }
        }
    }
}
