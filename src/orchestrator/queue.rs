//! Priority/dependency work queue
//!
//! Items become ready once every blocker has completed. Ready items are
//! released by descending priority, then by insertion order. Workers wait in
//! [`WorkQueue::get`] and are woken whenever an item becomes ready, an item
//! leaves flight, or a backoff delay expires.

use super::graph::GraphError;
use super::types::{ItemStatus, WorkItem};
use crate::config::RetryConfig;
use crate::error::Result;
use crate::utils::lock_mutex_recover;
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// What `requeue` did with an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// Back in the queue; visible again after `delay`
    Requeued { retry_count: u32, delay: Duration },
    /// Retry bound reached, the item is now permanently failed
    Exhausted { retries: u32 },
    /// The item was not in flight, nothing changed
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: String,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct DelayedEntry {
    visible_at: Instant,
    entry: ReadyEntry,
}

#[derive(Debug, Default)]
struct QueueState {
    items: HashMap<String, WorkItem>,
    /// Insertion order, for snapshots
    order: Vec<String>,
    /// Current ordering key per item; bumped when a requeue deprioritizes
    seqs: HashMap<String, u64>,
    /// blocker id -> items it blocks
    dependents: HashMap<String, BTreeSet<String>>,
    ready: BinaryHeap<ReadyEntry>,
    delayed: Vec<DelayedEntry>,
    next_seq: u64,
}

impl QueueState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn blockers_completed(&self, id: &str) -> bool {
        self.items.get(id).is_some_and(|item| {
            item.blocked_by.iter().all(|blocker| {
                self.items
                    .get(blocker)
                    .is_some_and(|b| b.status == ItemStatus::Completed)
            })
        })
    }

    fn entry_for(&self, id: &str) -> Option<ReadyEntry> {
        let item = self.items.get(id)?;
        Some(ReadyEntry {
            priority: item.priority,
            seq: self.seqs.get(id).copied().unwrap_or_default(),
            id: id.to_string(),
        })
    }

    fn make_ready(&mut self, id: &str) {
        if let Some(entry) = self.entry_for(id) {
            if let Some(item) = self.items.get_mut(id) {
                item.status = ItemStatus::Ready;
            }
            self.ready.push(entry);
        }
    }

    /// Move pending dependents of `id` whose blockers are all completed to ready
    fn promote_dependents(&mut self, id: &str) -> Vec<String> {
        let dependents: Vec<String> = self
            .dependents
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();

        let mut promoted = Vec::new();
        for dependent in dependents {
            let pending = self
                .items
                .get(&dependent)
                .is_some_and(|item| item.status == ItemStatus::Pending);
            if pending && self.blockers_completed(&dependent) {
                self.make_ready(&dependent);
                promoted.push(dependent);
            }
        }
        promoted
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, waiting): (Vec<DelayedEntry>, Vec<DelayedEntry>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.visible_at <= now);
        self.delayed = waiting;

        for delayed in due {
            let requeued = self
                .items
                .get(&delayed.entry.id)
                .is_some_and(|item| item.status == ItemStatus::Requeued);
            if requeued {
                if let Some(item) = self.items.get_mut(&delayed.entry.id) {
                    item.status = ItemStatus::Ready;
                }
                self.ready.push(delayed.entry);
            }
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.delayed.iter().map(|d| d.visible_at).min()
    }

    fn pop_ready(&mut self) -> Option<WorkItem> {
        while let Some(entry) = self.ready.pop() {
            let current = self.items.get(&entry.id).is_some_and(|item| {
                item.status == ItemStatus::Ready && self.seqs.get(&entry.id) == Some(&entry.seq)
            });
            if !current {
                continue;
            }

            if !self.blockers_completed(&entry.id) {
                log::error!(
                    "[WorkQueue] {} was ready with incomplete blockers, returning it to pending",
                    entry.id
                );
                if let Some(item) = self.items.get_mut(&entry.id) {
                    item.status = ItemStatus::Pending;
                }
                continue;
            }

            if let Some(item) = self.items.get_mut(&entry.id) {
                item.status = ItemStatus::Assigned;
                return Some(item.clone());
            }
        }
        None
    }
}

/// Concurrency-safe priority/dependency queue
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    retry: RetryConfig,
}

impl WorkQueue {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            retry,
        }
    }

    /// Insert an item.
    ///
    /// Completed and failed items keep their status (resumed runs); every
    /// other item is re-derived as pending or ready from its blockers.
    pub fn add(&self, mut item: WorkItem) -> Result<()> {
        let mut state = lock_mutex_recover(&self.state);

        if state.items.contains_key(&item.id) {
            return Err(GraphError::DuplicateIssue(item.id).into());
        }

        let id = item.id.clone();
        let seq = state.take_seq();
        state.seqs.insert(id.clone(), seq);
        state.order.push(id.clone());

        for blocker in &item.blocked_by {
            state
                .dependents
                .entry(blocker.clone())
                .or_default()
                .insert(id.clone());
            if let Some(b) = state.items.get_mut(blocker) {
                b.unblocks.insert(id.clone());
            }
        }
        if let Some(known) = state.dependents.get(&id) {
            item.unblocks.extend(known.iter().cloned());
        }

        let terminal = item.status.is_terminal();
        if !terminal {
            item.status = ItemStatus::Pending;
        }
        let completed = item.status == ItemStatus::Completed;
        state.items.insert(id.clone(), item);

        if completed {
            state.promote_dependents(&id);
        } else if !terminal && state.blockers_completed(&id) {
            state.make_ready(&id);
        }

        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Wait up to `timeout` for a ready item and return it marked assigned
    pub async fn get(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut state = lock_mutex_recover(&self.state);
                state.promote_due(Instant::now());
                if let Some(item) = state.pop_ready() {
                    log::debug!("[WorkQueue] Assigned {}", item.id);
                    return Some(item);
                }
                state.next_visible_at()
            };

            if Instant::now() >= deadline {
                return None;
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Non-blocking variant of [`WorkQueue::get`]
    pub fn try_get(&self) -> Option<WorkItem> {
        let mut state = lock_mutex_recover(&self.state);
        state.promote_due(Instant::now());
        state.pop_ready()
    }

    /// Assigned -> merging. Returns false if the item was not assigned.
    pub fn mark_merging(&self, id: &str) -> bool {
        let mut state = lock_mutex_recover(&self.state);
        match state.items.get_mut(id) {
            Some(item) if item.status == ItemStatus::Assigned => {
                item.status = ItemStatus::Merging;
                true
            }
            _ => false,
        }
    }

    /// Complete an in-flight item and release its dependents.
    /// Returns the ids that became ready.
    pub fn mark_completed(&self, id: &str, merge_commit: Option<String>) -> Vec<String> {
        let mut state = lock_mutex_recover(&self.state);

        match state.items.get_mut(id) {
            Some(item) if item.status.is_in_flight() => {
                item.status = ItemStatus::Completed;
                item.merge_commit = merge_commit;
                item.last_error = None;
            }
            Some(item) => {
                log::warn!(
                    "[WorkQueue] Ignoring completion of {} in status {:?}",
                    id,
                    item.status
                );
                return Vec::new();
            }
            None => return Vec::new(),
        }

        let promoted = state.promote_dependents(id);
        drop(state);

        if !promoted.is_empty() {
            log::info!("[WorkQueue] {} completed, now ready: {:?}", id, promoted);
        }
        self.notify.notify_waiters();
        promoted
    }

    /// Permanently fail an item. Returns false if it was already terminal.
    pub fn mark_failed(&self, id: &str, reason: &str) -> bool {
        let mut state = lock_mutex_recover(&self.state);

        let changed = match state.items.get_mut(id) {
            Some(item) if !item.status.is_terminal() => {
                item.status = ItemStatus::Failed;
                item.last_error = Some(reason.to_string());
                true
            }
            _ => false,
        };
        drop(state);

        if changed {
            log::warn!("[WorkQueue] {} failed permanently: {}", id, reason);
            self.notify.notify_waiters();
        }
        changed
    }

    /// Return an in-flight item to the queue with an incremented retry counter.
    ///
    /// The item fails permanently once the counter reaches the retry bound.
    /// Calling this for an item that is not in flight does nothing.
    pub fn requeue(&self, id: &str, reason: &str) -> RequeueOutcome {
        let mut state = lock_mutex_recover(&self.state);

        let retry_count = match state.items.get_mut(id) {
            Some(item) if item.status.is_in_flight() => {
                item.retry_count += 1;
                item.last_error = Some(reason.to_string());
                item.retry_count
            }
            _ => return RequeueOutcome::Ignored,
        };

        let outcome = if retry_count >= self.retry.max_retries {
            if let Some(item) = state.items.get_mut(id) {
                item.status = ItemStatus::Failed;
            }
            log::warn!(
                "[WorkQueue] {} exhausted {} retries: {}",
                id,
                retry_count,
                reason
            );
            RequeueOutcome::Exhausted {
                retries: retry_count,
            }
        } else {
            if self.retry.deprioritize {
                let seq = state.take_seq();
                state.seqs.insert(id.to_string(), seq);
            }

            let delay = self.retry.backoff.delay_for(retry_count);
            if delay.is_zero() {
                state.make_ready(id);
            } else if let Some(entry) = state.entry_for(id) {
                if let Some(item) = state.items.get_mut(id) {
                    item.status = ItemStatus::Requeued;
                }
                state.delayed.push(DelayedEntry {
                    visible_at: Instant::now() + delay,
                    entry,
                });
            }

            log::info!(
                "[WorkQueue] Requeued {} (retry {}/{}, delay {:?}): {}",
                id,
                retry_count,
                self.retry.max_retries,
                delay,
                reason
            );
            RequeueOutcome::Requeued { retry_count, delay }
        };

        drop(state);
        self.notify.notify_waiters();
        outcome
    }

    /// No item is ready, waiting out a backoff, or in flight
    pub fn is_drained(&self) -> bool {
        let state = lock_mutex_recover(&self.state);
        !state.items.values().any(|item| {
            matches!(
                item.status,
                ItemStatus::Ready | ItemStatus::Requeued | ItemStatus::Assigned | ItemStatus::Merging
            )
        })
    }

    /// Number of items currently assigned or merging
    pub fn in_flight_count(&self) -> usize {
        let state = lock_mutex_recover(&self.state);
        state
            .items
            .values()
            .filter(|item| item.status.is_in_flight())
            .count()
    }

    /// Pending items with the blockers that never completed
    pub fn blocked_items(&self) -> Vec<(String, Vec<String>)> {
        let state = lock_mutex_recover(&self.state);
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id))
            .filter(|item| item.status == ItemStatus::Pending)
            .map(|item| {
                let blockers = item
                    .blocked_by
                    .iter()
                    .filter(|b| {
                        state
                            .items
                            .get(*b)
                            .map_or(true, |i| i.status != ItemStatus::Completed)
                    })
                    .cloned()
                    .collect();
                (item.id.clone(), blockers)
            })
            .collect()
    }

    pub fn item(&self, id: &str) -> Option<WorkItem> {
        lock_mutex_recover(&self.state).items.get(id).cloned()
    }

    /// All items in insertion order
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let state = lock_mutex_recover(&self.state);
        state
            .order
            .iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    /// Wake every waiting `get` caller so it can re-check shutdown or drain
    pub fn wake_all(&self) {
        self.notify.notify_waiters();
    }
}
