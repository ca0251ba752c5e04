//! Concurrent issue processing
//!
//! The [`Orchestrator`] runs one dependency graph of issues against a git
//! repository:
//! - items are released by the [`WorkQueue`] once all their blockers completed
//! - a [`WorkerPool`] runs the agent for each item in its own worktree
//! - the [`MergeCoordinator`] integrates results one at a time
//! - progress is persisted after every event so a crashed run can be resumed

pub mod agent;
pub mod graph;
pub mod merge_coordinator;
pub mod queue;
pub mod report;
pub mod state;
#[cfg(test)]
pub(crate) mod test_support;
pub mod types;
pub mod worker;
pub mod workspace;

pub use agent::{AgentExecutor, AgentOutcome, CommandAgent};
pub use graph::{DependencyGraph, GraphError, IssueSpec};
pub use merge_coordinator::MergeCoordinator;
pub use queue::{RequeueOutcome, WorkQueue};
pub use report::RunReport;
pub use state::{JsonStateStore, OrchestratorState, ProgressRecorder, StateStore};
pub use types::{ItemStatus, MergeOutcome, MergeStatus, WorkItem, WorkResult};
pub use worker::{PoolSummary, WorkerContext, WorkerPool};
pub use workspace::{LeftoverWorkspace, Workspace, WorkspaceManager};

use crate::config::{LeftoverPolicy, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::git::GitManager;
use crate::scope_lock::{AcquireOutcome, ScopeLease, ScopeLockManager};
use crate::shutdown::ShutdownState;
use crate::utils::generate_run_id;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Runs dependency graphs of issues against one repository
pub struct Orchestrator {
    repo_root: PathBuf,
    git_dir: PathBuf,
    integration_branch: String,
    config: OrchestratorConfig,
    executor: Arc<dyn AgentExecutor>,
    store: Arc<dyn StateStore>,
    shutdown: ShutdownState,
}

impl Orchestrator {
    /// Open the repository and resolve the integration branch
    pub fn new(
        repo_path: &Path,
        config: OrchestratorConfig,
        executor: Arc<dyn AgentExecutor>,
        shutdown: ShutdownState,
    ) -> Result<Self> {
        config.validate()?;

        let git = GitManager::new(repo_path).map_err(|e| {
            OrchestratorError::ResourceExhaustion(format!(
                "cannot open repository at {}: {}",
                repo_path.display(),
                e
            ))
        })?;
        let repo_root = git.workdir().ok_or_else(|| {
            OrchestratorError::Config(format!(
                "{} is a bare repository; a working copy is required",
                repo_path.display()
            ))
        })?;

        let integration_branch = config
            .integration_branch
            .clone()
            .unwrap_or_else(|| git.get_default_branch_name());
        if !git.branch_exists(&integration_branch) {
            return Err(OrchestratorError::Config(format!(
                "integration branch '{}' does not exist",
                integration_branch
            )));
        }

        let store: Arc<dyn StateStore> =
            Arc::new(JsonStateStore::new(config.state_dir_for(&repo_root)));

        Ok(Self {
            git_dir: git.repo_path(),
            repo_root,
            integration_branch,
            config,
            executor,
            store,
            shutdown,
        })
    }

    /// Use a different state store
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn scope_locks(&self) -> ScopeLockManager {
        ScopeLockManager::new(self.config.lock_dir_for(&self.git_dir))
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Process every issue of `graph` under a new run id
    pub async fn run(&self, graph: &DependencyGraph) -> Result<RunReport> {
        let run_id = generate_run_id();
        log::info!(
            "[Orchestrator] Starting run {} with {} issues on {}",
            run_id,
            graph.len(),
            self.integration_branch
        );
        self.execute(
            &run_id,
            &self.integration_branch,
            graph.to_work_items(),
            Utc::now(),
        )
        .await
    }

    /// Continue a persisted run: `run_id`, or the most recent one
    pub async fn resume(&self, run_id: Option<&str>) -> Result<RunReport> {
        let run_id = match run_id {
            Some(id) => id.to_string(),
            None => self.store.latest_run_id()?.ok_or_else(|| {
                OrchestratorError::State("no previous run to resume".to_string())
            })?,
        };
        let state = self.store.load(&run_id)?.ok_or_else(|| {
            OrchestratorError::State(format!("no saved state for run {}", run_id))
        })?;

        if state.integration_branch != self.integration_branch {
            log::warn!(
                "[Orchestrator] Run {} targets {}, not {}; keeping the run's branch",
                run_id,
                state.integration_branch,
                self.integration_branch
            );
        }

        log::info!(
            "[Orchestrator] Resuming run {} ({} completed, {} failed, {} in flight when saved)",
            run_id,
            state.completed.len(),
            state.failed.len(),
            state.active_assignments.len()
        );
        self.execute(
            &run_id,
            &state.integration_branch,
            state.resume_items(),
            state.started_at,
        )
        .await
    }

    async fn execute(
        &self,
        run_id: &str,
        integration_branch: &str,
        items: Vec<WorkItem>,
        started_at: DateTime<Utc>,
    ) -> Result<RunReport> {
        let queue = Arc::new(WorkQueue::new(self.config.retry.clone()));
        for item in items {
            queue.add(item)?;
        }

        let recorder = Arc::new(ProgressRecorder::resumed(
            queue.clone(),
            self.store.clone(),
            run_id,
            integration_branch,
            started_at,
        ));
        // Saved before the scope wait so an interrupted start can be resumed
        recorder.save(false)?;

        let lease = match self.acquire_scopes(run_id).await? {
            Some(lease) => lease,
            None => {
                log::warn!(
                    "[Orchestrator] Shutdown requested while waiting for scopes of run {}",
                    run_id
                );
                return Ok(self.report(run_id, integration_branch, started_at, &queue));
            }
        };

        let outcome = self
            .process(run_id, integration_branch, &queue, &recorder)
            .await;

        let interrupted = self.shutdown.is_shutdown_requested() || outcome.is_err();
        let saved = recorder.save(!interrupted);

        match tokio::task::spawn_blocking(move || lease.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("[Orchestrator] Failed to release scope lock of {}: {}", run_id, e)
            }
            Err(e) => log::warn!("[Orchestrator] Scope lock release task failed: {}", e),
        }

        let summary = outcome?;
        saved?;

        let report = self.report(run_id, integration_branch, started_at, &queue);
        for (id, blockers) in queue.blocked_items() {
            log::debug!("[Orchestrator] {} still waits on {:?}", id, blockers);
        }
        log::info!(
            "[Orchestrator] {} ({} attempts)",
            report.summary_line(),
            summary.attempts
        );
        Ok(report)
    }

    /// Claim the run's scopes. Returns `None` if shutdown won the wait.
    async fn acquire_scopes(&self, run_id: &str) -> Result<Option<ScopeLease>> {
        let locks = self.scope_locks();
        let scopes = self.config.effective_scopes();

        let outcome = if self.config.queue_on_scope_conflict {
            tokio::select! {
                outcome = locks.acquire_with_wait(
                    run_id,
                    &scopes,
                    self.config.scope_wait_timeout(),
                    self.config.scope_poll_interval(),
                ) => outcome?,
                _ = self.shutdown.wait() => return Ok(None),
            }
        } else {
            locks.acquire_async(run_id, &scopes).await?
        };

        if let AcquireOutcome::Conflict(record) = &outcome {
            log::error!(
                "[Orchestrator] Scopes {:?} are held by {} (pid {} on {})",
                record.scopes,
                record.holder,
                record.pid,
                record.host
            );
        }
        outcome.into_result(&scopes).map(Some)
    }

    /// Workspaces, merge lane and workers for one run
    async fn process(
        &self,
        run_id: &str,
        integration_branch: &str,
        queue: &Arc<WorkQueue>,
        recorder: &Arc<ProgressRecorder>,
    ) -> Result<PoolSummary> {
        let git_lock = Arc::new(Mutex::new(()));
        let workspaces = Arc::new(WorkspaceManager::new(
            &self.repo_root,
            &self.config.workspace_root_for(&self.repo_root),
            &self.config.branch_prefix,
            integration_branch,
            git_lock.clone(),
        )?);

        self.handle_leftovers(&workspaces)?;

        let coordinator = Arc::new(MergeCoordinator::start(
            self.repo_root.clone(),
            integration_branch.to_string(),
            git_lock,
            queue.clone(),
            workspaces.clone(),
            recorder.clone(),
            self.config.max_workers,
        )?);

        let pool = WorkerPool::start(
            self.config.max_workers,
            WorkerContext {
                queue: queue.clone(),
                workspaces: workspaces.clone(),
                coordinator: coordinator.clone(),
                executor: self.executor.clone(),
                recorder: recorder.clone(),
                shutdown: self.shutdown.clone(),
                item_timeout: self.config.item_timeout(),
                dequeue_timeout: self.config.dequeue_timeout(),
                commit_agent_changes: self.config.commit_agent_changes,
            },
        );

        let summary = match pool {
            Ok(pool) => pool.join().await,
            Err(e) => Err(e),
        };

        coordinator.close().await;

        let cleanup = workspaces.clone();
        let (released, discarded) = tokio::task::spawn_blocking(move || {
            (cleanup.release_all(), cleanup.discard_unadopted())
        })
        .await
        .unwrap_or_else(|e| {
            log::warn!("[Orchestrator] Workspace cleanup task failed: {}", e);
            (0, 0)
        });
        if released + discarded > 0 {
            log::info!(
                "[Orchestrator] Run {} cleaned up {} workspaces and {} unclaimed leftovers",
                run_id,
                released,
                discarded
            );
        }

        summary
    }

    fn handle_leftovers(&self, workspaces: &WorkspaceManager) -> Result<()> {
        let leftovers = workspaces.scan_leftovers()?;
        if leftovers.is_empty() {
            return Ok(());
        }

        match self.config.leftover_policy {
            LeftoverPolicy::Cleanup => {
                let cleaned = workspaces.cleanup_leftovers(&leftovers);
                log::info!(
                    "[Orchestrator] Cleaned up {} of {} leftover workspaces",
                    cleaned,
                    leftovers.len()
                );
            }
            LeftoverPolicy::Adopt => {
                let total = leftovers.len();
                let adoptable = workspaces.adopt_leftovers(leftovers);
                log::info!(
                    "[Orchestrator] {} of {} leftover workspaces can be adopted",
                    adoptable,
                    total
                );
            }
        }
        Ok(())
    }

    fn report(
        &self,
        run_id: &str,
        integration_branch: &str,
        started_at: DateTime<Utc>,
        queue: &WorkQueue,
    ) -> RunReport {
        RunReport::from_items(
            run_id,
            integration_branch,
            started_at,
            &queue.snapshot(),
            self.shutdown.is_shutdown_requested(),
        )
    }
}
