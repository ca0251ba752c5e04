// Cross-run scope locks backed by files in a shared lock directory

use crate::error::{OrchestratorError, Result};
use crate::utils::sanitize_path_component;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

const REGISTRY_LOCK_FILE: &str = "registry.lock";
const RECORD_EXTENSION: &str = "json";

/// Durable record of a held scope lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Holder identifier (the run id for orchestrator runs)
    pub holder: String,
    /// Process that holds the lock
    pub pid: u32,
    /// Host the holder runs on
    pub host: String,
    /// Claimed path-glob scopes
    pub scopes: Vec<String>,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn for_current_process(holder: &str, scopes: &[String]) -> Self {
        Self {
            holder: holder.to_string(),
            pid: std::process::id(),
            host: current_host(),
            scopes: scopes.to_vec(),
            acquired_at: Utc::now(),
        }
    }

    /// A record is stale when it was written on this host by a process that is gone.
    /// Records from other hosts cannot be checked and are never stale.
    pub fn is_stale(&self) -> bool {
        self.host == current_host() && !is_process_alive(self.pid)
    }

    pub fn overlaps(&self, scopes: &[String]) -> bool {
        scope_sets_overlap(&self.scopes, scopes)
    }
}

/// Result of an acquisition attempt
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(ScopeLease),
    /// The requested scopes overlap a live lock held by this record
    Conflict(LockRecord),
}

impl AcquireOutcome {
    /// Convert a conflict into [`OrchestratorError::ScopeConflict`]
    pub fn into_result(self, requested: &[String]) -> Result<ScopeLease> {
        match self {
            AcquireOutcome::Acquired(lease) => Ok(lease),
            AcquireOutcome::Conflict(record) => Err(OrchestratorError::ScopeConflict {
                holder: record.holder,
                held: record.scopes,
                requested: requested.to_vec(),
            }),
        }
    }
}

/// A held scope lock, released on drop
#[derive(Debug)]
pub struct ScopeLease {
    manager: ScopeLockManager,
    holder: String,
    released: bool,
}

impl ScopeLease {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock explicitly
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.holder).map(|_| ())
    }
}

impl Drop for ScopeLease {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.manager.release(&self.holder) {
                log::warn!("[ScopeLock] Failed to release lock for {}: {}", self.holder, e);
            }
        }
    }
}

/// Scope lock manager
///
/// Each holder owns one record file in the lock directory. Check-then-create
/// runs under an exclusive OS file lock on `registry.lock`, so independent
/// processes never both pass the overlap check.
#[derive(Debug, Clone)]
pub struct ScopeLockManager {
    lock_dir: PathBuf,
}

impl ScopeLockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Claim `scopes` for `holder` unless a live lock overlaps them
    pub fn acquire(&self, holder: &str, scopes: &[String]) -> Result<AcquireOutcome> {
        let _registry = self.lock_registry(true)?;

        for (path, record) in self.read_records()? {
            let Some(record) = record else {
                log::warn!(
                    "[ScopeLock] Removing unreadable lock record {}",
                    path.display()
                );
                remove_if_exists(&path)?;
                continue;
            };

            if record.holder == holder {
                // Re-acquisition by the same holder replaces its record
                remove_if_exists(&path)?;
                continue;
            }

            if record.is_stale() {
                log::info!(
                    "[ScopeLock] Reclaiming stale lock of {} (pid {} is gone)",
                    record.holder,
                    record.pid
                );
                remove_if_exists(&path)?;
                continue;
            }

            if record.overlaps(scopes) {
                log::debug!(
                    "[ScopeLock] {:?} conflicts with {:?} held by {}",
                    scopes,
                    record.scopes,
                    record.holder
                );
                return Ok(AcquireOutcome::Conflict(record));
            }
        }

        let record = LockRecord::for_current_process(holder, scopes);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.record_path(holder))?;
        file.write_all(serde_json::to_string_pretty(&record)?.as_bytes())?;
        file.sync_all()?;

        log::info!("[ScopeLock] {} acquired {:?}", holder, scopes);

        Ok(AcquireOutcome::Acquired(ScopeLease {
            manager: self.clone(),
            holder: holder.to_string(),
            released: false,
        }))
    }

    /// Remove the holder's record. Returns whether a record existed.
    pub fn release(&self, holder: &str) -> Result<bool> {
        let _registry = self.lock_registry(true)?;
        let removed = remove_if_exists(&self.record_path(holder))?;
        if removed {
            log::info!("[ScopeLock] {} released its scopes", holder);
        }
        Ok(removed)
    }

    /// Remove a record regardless of whether its holder is alive
    pub fn force_release(&self, holder: &str) -> Result<bool> {
        let removed = self.release(holder)?;
        if removed {
            log::warn!("[ScopeLock] Force-released lock of {}", holder);
        }
        Ok(removed)
    }

    /// Read-only overlap check against live locks
    pub fn find_conflict(&self, scopes: &[String]) -> Result<Option<LockRecord>> {
        let _registry = self.lock_registry(false)?;

        Ok(self
            .read_records()?
            .into_iter()
            .filter_map(|(_, record)| record)
            .find(|record| !record.is_stale() && record.overlaps(scopes)))
    }

    /// All readable records with their staleness
    pub fn list_locks(&self) -> Result<Vec<(LockRecord, bool)>> {
        let _registry = self.lock_registry(false)?;

        let mut locks: Vec<(LockRecord, bool)> = self
            .read_records()?
            .into_iter()
            .filter_map(|(_, record)| record)
            .map(|record| {
                let stale = record.is_stale();
                (record, stale)
            })
            .collect();
        locks.sort_by(|a, b| a.0.acquired_at.cmp(&b.0.acquired_at));
        Ok(locks)
    }

    /// [`acquire`](Self::acquire) on the blocking pool, for async callers
    pub async fn acquire_async(&self, holder: &str, scopes: &[String]) -> Result<AcquireOutcome> {
        let holder = holder.to_string();
        let scopes = scopes.to_vec();
        self.off_runtime(move |locks| locks.acquire(&holder, &scopes)).await
    }

    /// Poll until no live lock overlaps `scopes`.
    /// Returns the last conflicting record if `timeout` elapses first.
    pub async fn wait_for_scope(
        &self,
        scopes: &[String],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Option<LockRecord>> {
        let deadline = Instant::now() + timeout;

        loop {
            let requested = scopes.to_vec();
            let found = self
                .off_runtime(move |locks| locks.find_conflict(&requested))
                .await?;
            let conflict = match found {
                None => return Ok(None),
                Some(record) => record,
            };

            if Instant::now() >= deadline {
                return Ok(Some(conflict));
            }

            log::debug!(
                "[ScopeLock] Waiting for {} to release {:?}",
                conflict.holder,
                conflict.scopes
            );
            tokio::time::sleep_until((Instant::now() + poll_interval).min(deadline)).await;
        }
    }

    /// Acquire, waiting up to `timeout` for conflicting holders to release
    pub async fn acquire_with_wait(
        &self,
        holder: &str,
        scopes: &[String],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<AcquireOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.acquire_async(holder, scopes).await? {
                AcquireOutcome::Acquired(lease) => return Ok(AcquireOutcome::Acquired(lease)),
                AcquireOutcome::Conflict(record) if Instant::now() >= deadline => {
                    return Ok(AcquireOutcome::Conflict(record));
                }
                AcquireOutcome::Conflict(record) => {
                    log::info!(
                        "[ScopeLock] Scope busy (held by {}), waiting",
                        record.holder
                    );
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if self
                        .wait_for_scope(scopes, remaining, poll_interval)
                        .await?
                        .is_some()
                    {
                        // Timed out while waiting; one last attempt reports the holder
                        return self.acquire_async(holder, scopes).await;
                    }
                }
            }
        }
    }

    /// The registry lock may block on another process, so keep it off the async workers
    async fn off_runtime<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScopeLockManager) -> Result<T> + Send + 'static,
    {
        let locks = self.clone();
        tokio::task::spawn_blocking(move || op(&locks))
            .await
            .map_err(|e| {
                OrchestratorError::ResourceExhaustion(format!("scope lock task failed: {}", e))
            })?
    }

    fn record_path(&self, holder: &str) -> PathBuf {
        self.lock_dir.join(format!(
            "{}.{}",
            sanitize_path_component(holder),
            RECORD_EXTENSION
        ))
    }

    fn lock_registry(&self, exclusive: bool) -> Result<File> {
        fs::create_dir_all(&self.lock_dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_dir.join(REGISTRY_LOCK_FILE))?;

        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        // The OS lock is released when the file handle is dropped
        Ok(file)
    }

    fn read_records(&self) -> Result<Vec<(PathBuf, Option<LockRecord>)>> {
        let mut records = Vec::new();
        if !self.lock_dir.exists() {
            return Ok(records);
        }

        for entry in fs::read_dir(&self.lock_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            let record = fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<LockRecord>(&content).ok());
            records.push((path, record));
        }

        Ok(records)
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn current_host() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn is_process_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// Literal path prefix of a scope pattern, cut at the first wildcard component.
/// An empty result covers the whole repository.
fn scope_prefix(pattern: &str) -> Vec<&str> {
    pattern
        .trim()
        .split(['/', '\\'])
        .filter(|component| !component.is_empty() && *component != ".")
        .take_while(|component| !component.contains(['*', '?', '[']))
        .collect()
}

/// Two scopes overlap when one literal prefix contains the other
pub fn scopes_overlap(a: &str, b: &str) -> bool {
    let a = scope_prefix(a);
    let b = scope_prefix(b);
    let shared = a.len().min(b.len());
    a[..shared] == b[..shared]
}

pub fn scope_sets_overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| b.iter().any(|y| scopes_overlap(x, y)))
}
