//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use git2::{Repository, Signature};
use issue_orchestrator_lib::orchestrator::{JsonStateStore, OrchestratorState, StateStore};
use issue_orchestrator_lib::{AgentExecutor, AgentOutcome, ItemStatus, OrchestratorConfig, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Repository with one commit on `main`, inside `temp/repo`
pub fn init_repo() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path().join("repo");
    fs::create_dir_all(&repo_path).unwrap();

    let repo = Repository::init(&repo_path).unwrap();
    repo.set_head("refs/heads/main").unwrap();

    fs::write(repo_path.join("README.md"), "# test\n").unwrap();
    fs::write(repo_path.join("shared.txt"), "line 1\nline 2\nline 3\n").unwrap();

    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();

    (temp_dir, repo_path)
}

/// Config keeping locks and state inside the temp dir
pub fn test_config(temp: &Path, max_workers: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        max_workers,
        dequeue_timeout_ms: 20,
        lock_dir: Some(temp.join("locks")),
        state_dir: Some(temp.join("runs")),
        ..Default::default()
    };
    config.retry.max_retries = 3;
    config
}

/// Content of `file` at the tip of `branch`
pub fn file_at_branch(repo_path: &Path, branch: &str, file: &str) -> Option<String> {
    let repo = Repository::open(repo_path).unwrap();
    let tree = repo
        .find_branch(branch, git2::BranchType::Local)
        .ok()?
        .get()
        .peel_to_tree()
        .ok()?;
    let entry = tree.get_path(Path::new(file)).ok()?;
    let blob = repo.find_blob(entry.id()).ok()?;
    Some(String::from_utf8_lossy(blob.content()).to_string())
}

/// Whether `descendant` has `ancestor` in its history
pub fn is_ancestor(repo_path: &Path, ancestor: &str, descendant: &str) -> bool {
    let repo = Repository::open(repo_path).unwrap();
    let a = git2::Oid::from_str(ancestor).unwrap();
    let d = git2::Oid::from_str(descendant).unwrap();
    repo.graph_descendant_of(d, a).unwrap()
}

/// What a scripted agent does on one attempt
#[derive(Clone)]
pub enum Step {
    /// Write `content` to `file`
    Write { file: String, content: String },
    /// Replace line 2 of shared.txt with `line`
    EditSharedLine { line: String },
    Fail(String),
    /// Never finish on its own
    Hang,
}

type Hook = Arc<dyn Fn(&str, usize) + Send + Sync>;

/// In-process agent driven by a per-item script.
///
/// Attempts past the end of an item's script repeat its last step; items
/// without a script write `<id>.txt`.
#[derive(Clone, Default)]
pub struct ScriptedAgent {
    scripts: Arc<Mutex<HashMap<String, Vec<Step>>>>,
    attempts: Arc<Mutex<HashMap<String, usize>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    delay: Duration,
    on_start: Option<Hook>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().insert(id.to_string(), steps);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Called with the item id and attempt number before each attempt runs
    pub fn on_start(mut self, hook: impl Fn(&str, usize) + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn attempts(&self, id: &str) -> usize {
        self.attempts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn next_step(&self, id: &str) -> (usize, Step) {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get(id)
            .and_then(|steps| steps.get(attempt - 1).or(steps.last()).cloned())
            .unwrap_or_else(|| Step::Write {
                file: format!("{}.txt", id),
                content: format!("{}\n", id),
            });
        (attempt, step)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn execute(&self, item_id: &str, workspace: &Path, _timeout: Duration) -> AgentOutcome {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(self.running.clone());

        let (attempt, step) = self.next_step(item_id);
        if let Some(hook) = &self.on_start {
            hook(item_id, attempt);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match step {
            Step::Write { file, content } => {
                fs::write(workspace.join(file), content).unwrap();
            }
            Step::EditSharedLine { line } => {
                let path = workspace.join("shared.txt");
                let current = fs::read_to_string(&path).unwrap();
                let mut lines: Vec<String> = current.lines().map(String::from).collect();
                lines[1] = line;
                fs::write(&path, format!("{}\n", lines.join("\n"))).unwrap();
            }
            Step::Fail(reason) => return AgentOutcome::failure(reason, Duration::ZERO),
            Step::Hang => std::future::pending::<()>().await,
        }
        AgentOutcome::success("ok", Duration::ZERO)
    }
}

/// State store that checks run invariants on every snapshot
pub struct CheckingStore {
    inner: JsonStateStore,
    pub max_in_flight: AtomicUsize,
    pub max_merging: AtomicUsize,
    pub saves: AtomicUsize,
}

impl CheckingStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            inner: JsonStateStore::new(dir),
            max_in_flight: AtomicUsize::new(0),
            max_merging: AtomicUsize::new(0),
            saves: AtomicUsize::new(0),
        }
    }
}

impl StateStore for CheckingStore {
    fn save(&self, state: &OrchestratorState) -> Result<()> {
        let merging = state
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Merging)
            .count();
        self.max_merging.fetch_max(merging, Ordering::SeqCst);
        self.max_in_flight
            .fetch_max(state.active_assignments.len(), Ordering::SeqCst);
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(state)
    }

    fn load(&self, run_id: &str) -> Result<Option<OrchestratorState>> {
        self.inner.load(run_id)
    }

    fn latest_run_id(&self) -> Result<Option<String>> {
        self.inner.latest_run_id()
    }
}

/// Final (completed, failed, blocked) partition of a run
pub fn partition(report: &issue_orchestrator_lib::RunReport) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut completed: Vec<String> = report.completed.iter().map(|e| e.id.clone()).collect();
    let mut failed: Vec<String> = report.failed.iter().map(|e| e.id.clone()).collect();
    let mut blocked: Vec<String> = report.blocked.iter().map(|e| e.id.clone()).collect();
    completed.sort();
    failed.sort();
    blocked.sort();
    (completed, failed, blocked)
}

/// Stage everything in the working copy at `path` and commit it on HEAD
pub fn commit_in(path: &Path, message: &str) {
    let repo = Repository::open(path).unwrap();
    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let parent = repo.head().unwrap().peel_to_commit().unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
        .unwrap();
}
