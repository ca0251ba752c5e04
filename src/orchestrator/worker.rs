//! Worker Pool
//!
//! A fixed number of worker tasks pull items from the queue, run the agent in
//! a fresh workspace and hand the result to the merge coordinator. A worker
//! owns its workspace until the coordinator has consumed or rejected it.

use super::agent::AgentExecutor;
use super::merge_coordinator::MergeCoordinator;
use super::queue::{RequeueOutcome, WorkQueue};
use super::state::ProgressRecorder;
use super::types::{MergeStatus, WorkResult};
use super::workspace::{Workspace, WorkspaceManager};
use crate::error::{OrchestratorError, Result};
use crate::git::GitManager;
use crate::shutdown::ShutdownState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Shared collaborators of every worker
pub struct WorkerContext {
    pub queue: Arc<WorkQueue>,
    pub workspaces: Arc<WorkspaceManager>,
    pub coordinator: Arc<MergeCoordinator>,
    pub executor: Arc<dyn AgentExecutor>,
    pub recorder: Arc<ProgressRecorder>,
    /// Process-wide shutdown (signals)
    pub shutdown: ShutdownState,
    pub item_timeout: Duration,
    pub dequeue_timeout: Duration,
    pub commit_agent_changes: bool,
}

/// Totals gathered from all workers once the pool stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub attempts: usize,
    pub merged: usize,
    pub interrupted: usize,
}

#[derive(Debug, Default)]
struct WorkerStats {
    attempts: usize,
    merged: usize,
    interrupted: usize,
}

enum Attempt {
    Merged,
    NotMerged,
    Interrupted,
}

/// Fixed-size pool of worker tasks
pub struct WorkerPool {
    tasks: JoinSet<Result<WorkerStats>>,
    size: usize,
    /// Stops the remaining workers after a fatal error in one of them
    halt: ShutdownState,
    queue: Arc<WorkQueue>,
}

impl WorkerPool {
    /// Spawn `size` workers. Must be called inside a tokio runtime.
    pub fn start(size: usize, ctx: WorkerContext) -> Result<Self> {
        if size == 0 {
            return Err(OrchestratorError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            OrchestratorError::ResourceExhaustion(format!("cannot spawn workers: {}", e))
        })?;

        let halt = ShutdownState::new();
        let queue = ctx.queue.clone();
        let ctx = Arc::new(ctx);
        let mut tasks = JoinSet::new();
        for index in 0..size {
            let ctx = ctx.clone();
            let halt = halt.clone();
            tasks.spawn_on(run_worker(index, ctx, halt), &runtime);
        }

        log::info!("[WorkerPool] Started {} workers", size);
        Ok(Self {
            tasks,
            size,
            halt,
            queue,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every worker to stop.
    ///
    /// Workers stop once the queue is drained or shutdown was requested. A
    /// worker that panicked or hit a fatal error stops the whole pool and
    /// the first such error is returned.
    pub async fn join(mut self) -> Result<PoolSummary> {
        let mut summary = PoolSummary::default();
        let mut first_error: Option<OrchestratorError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let error = match joined {
                Ok(Ok(stats)) => {
                    summary.attempts += stats.attempts;
                    summary.merged += stats.merged;
                    summary.interrupted += stats.interrupted;
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => OrchestratorError::ResourceExhaustion(format!("worker task failed: {}", e)),
            };

            log::error!("[WorkerPool] Stopping pool: {}", error);
            self.halt.request_shutdown();
            self.queue.wake_all();
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!(
                    "[WorkerPool] All workers stopped after {} attempts ({} merged)",
                    summary.attempts,
                    summary.merged
                );
                Ok(summary)
            }
        }
    }
}

fn should_stop(ctx: &WorkerContext, halt: &ShutdownState) -> bool {
    ctx.shutdown.is_shutdown_requested() || halt.is_shutdown_requested()
}

async fn stop_requested(ctx: &WorkerContext, halt: &ShutdownState) {
    tokio::select! {
        _ = ctx.shutdown.wait() => {}
        _ = halt.wait() => {}
    }
}

async fn run_worker(index: usize, ctx: Arc<WorkerContext>, halt: ShutdownState) -> Result<WorkerStats> {
    let mut stats = WorkerStats::default();
    log::debug!("[WorkerPool] Worker {} started", index);

    loop {
        if should_stop(&ctx, &halt) {
            break;
        }

        let next = tokio::select! {
            item = ctx.queue.get(ctx.dequeue_timeout) => item,
            _ = stop_requested(&ctx, &halt) => break,
        };

        let Some(item) = next else {
            if ctx.queue.is_drained() {
                break;
            }
            continue;
        };

        log::info!(
            "[WorkerPool] Worker {} picked up {} (priority {}, retry {})",
            index,
            item.id,
            item.priority,
            item.retry_count
        );
        ctx.recorder.persist();
        stats.attempts += 1;

        match process_item(&ctx, &halt, &item.id).await? {
            Attempt::Merged => stats.merged += 1,
            Attempt::NotMerged => {}
            Attempt::Interrupted => stats.interrupted += 1,
        }
    }

    log::debug!("[WorkerPool] Worker {} stopped", index);
    Ok(stats)
}

/// One attempt at one item. Only fatal errors are returned.
async fn process_item(ctx: &WorkerContext, halt: &ShutdownState, item_id: &str) -> Result<Attempt> {
    let workspaces = ctx.workspaces.clone();
    let id = item_id.to_string();
    let acquired = tokio::task::spawn_blocking(move || workspaces.acquire(&id))
        .await
        .unwrap_or_else(|e| Err(OrchestratorError::workspace(item_id, e)));

    let workspace = match acquired {
        Ok(workspace) => workspace,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            log::warn!("[WorkerPool] {}", e);
            requeue(ctx, item_id, &e.to_string());
            return Ok(Attempt::NotMerged);
        }
    };

    let start = Instant::now();
    let run = tokio::time::timeout(
        ctx.item_timeout,
        ctx.executor
            .execute(item_id, &workspace.path, ctx.item_timeout),
    );

    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = stop_requested(ctx, halt) => {
            // The agent future is dropped here, which cancels the external run
            log::info!("[WorkerPool] Interrupted {}, discarding its workspace", item_id);
            discard(ctx, workspace).await;
            return Ok(Attempt::Interrupted);
        }
    };

    let mut result = WorkResult {
        item_id: item_id.to_string(),
        success: false,
        branch: workspace.branch.clone(),
        workspace_path: workspace.path.clone(),
        diagnostic: String::new(),
        elapsed: start.elapsed(),
        timed_out: false,
    };

    match outcome {
        Ok(agent) => {
            result.success = agent.success;
            result.diagnostic = agent.diagnostic;
        }
        Err(_) => {
            result.timed_out = true;
            result.diagnostic = OrchestratorError::AgentTimeout {
                item_id: item_id.to_string(),
                timeout_secs: ctx.item_timeout.as_secs(),
            }
            .to_string();
            log::warn!("[WorkerPool] {}", result.diagnostic);
        }
    }

    if result.success && ctx.commit_agent_changes {
        if let Err(e) = commit_changes(&workspace).await {
            result.success = false;
            result.diagnostic = format!("cannot commit agent changes: {}", e);
        }
    }

    log::info!(
        "[WorkerPool] {} finished in {:?} ({}), submitting for merge",
        item_id,
        result.elapsed,
        if result.success { "success" } else { "failure" }
    );

    let outcome = ctx.coordinator.submit(result, workspace).await?;
    Ok(match outcome.status {
        MergeStatus::Merged => Attempt::Merged,
        MergeStatus::Conflict | MergeStatus::Aborted => Attempt::NotMerged,
    })
}

async fn commit_changes(workspace: &Workspace) -> Result<()> {
    let path = workspace.path.clone();
    let message = format!("Apply agent changes for {}", workspace.item_id);
    tokio::task::spawn_blocking(move || -> Result<()> {
        GitManager::new(&path)?.commit_all(&message)?;
        Ok(())
    })
    .await
    .map_err(|e| OrchestratorError::workspace(&workspace.item_id, e))?
}

fn requeue(ctx: &WorkerContext, item_id: &str, reason: &str) {
    if let RequeueOutcome::Exhausted { retries } = ctx.queue.requeue(item_id, reason) {
        log::warn!(
            "[WorkerPool] {}",
            OrchestratorError::RetryExhausted {
                item_id: item_id.to_string(),
                retries,
            }
        );
    }
    ctx.recorder.persist();
}

/// Destroy an interrupted attempt's workspace; the item stays assigned so a
/// resumed run restarts it
async fn discard(ctx: &WorkerContext, workspace: Workspace) {
    let workspaces = ctx.workspaces.clone();
    let item_id = workspace.item_id.clone();
    match tokio::task::spawn_blocking(move || workspaces.release(&workspace)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("[WorkerPool] Failed to discard workspace of {}: {}", item_id, e),
        Err(e) => log::warn!("[WorkerPool] Cleanup task for {} failed: {}", item_id, e),
    }
    ctx.recorder.persist();
}
