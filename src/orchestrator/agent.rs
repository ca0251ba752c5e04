//! Agent execution interface
//!
//! The orchestrator hands each item to an [`AgentExecutor`] inside the item's
//! workspace. [`CommandAgent`] runs an external program for that purpose.

use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Upper bound for the diagnostic text kept from agent output
const DIAGNOSTIC_TAIL_BYTES: usize = 4000;

/// Result of one agent run
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub success: bool,
    /// Opaque text for the run report
    pub diagnostic: String,
    pub duration: Duration,
}

impl AgentOutcome {
    pub fn success(diagnostic: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            diagnostic: diagnostic.into(),
            duration,
        }
    }

    pub fn failure(diagnostic: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            diagnostic: diagnostic.into(),
            duration,
        }
    }
}

/// Processes one issue inside its workspace.
///
/// The worker enforces `timeout` by dropping the returned future, so
/// implementations must stop their external work when dropped.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, item_id: &str, workspace: &Path, timeout: Duration) -> AgentOutcome;
}

/// Runs an external program once per issue.
///
/// `{issue}` and `{workspace}` in the arguments are replaced with the item id
/// and workspace path; both are also exported as `ISSUE_ID` and
/// `ISSUE_WORKSPACE`. The process runs with the workspace as its working
/// directory and is killed when the run is cancelled.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandAgent {
    /// Resolve `program` on `PATH` (or as a path) and keep the argument template
    pub fn new(program: &str, args: Vec<String>) -> Result<Self> {
        let resolved = which::which(program).map_err(|e| {
            OrchestratorError::Config(format!("Agent program '{}' not found: {}", program, e))
        })?;

        Ok(Self {
            program: resolved,
            args,
        })
    }

    /// Build from a full command line (`program arg...`)
    pub fn from_command_line(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| OrchestratorError::Config("Agent command is empty".to_string()))?;
        Self::new(program, args.to_vec())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn render_args(&self, item_id: &str, workspace: &Path) -> Vec<String> {
        let workspace = workspace.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{issue}", item_id)
                    .replace("{workspace}", &workspace)
            })
            .collect()
    }
}

#[async_trait]
impl AgentExecutor for CommandAgent {
    async fn execute(&self, item_id: &str, workspace: &Path, timeout: Duration) -> AgentOutcome {
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(item_id, workspace))
            .current_dir(workspace)
            .env("ISSUE_ID", item_id)
            .env("ISSUE_WORKSPACE", workspace)
            .env("ISSUE_TIMEOUT_SECS", timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        log::debug!(
            "[CommandAgent] Running {:?} for {} in {:?}",
            self.program,
            item_id,
            workspace
        );

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                return AgentOutcome::failure(
                    format!("Failed to spawn {}: {}", self.program.display(), e),
                    start.elapsed(),
                );
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let mut diagnostic = tail(combined.trim(), DIAGNOSTIC_TAIL_BYTES).to_string();

        if output.status.success() {
            AgentOutcome::success(diagnostic, start.elapsed())
        } else {
            let status = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            diagnostic = if diagnostic.is_empty() {
                format!("Agent failed ({})", status)
            } else {
                format!("Agent failed ({}): {}", status, diagnostic)
            };
            AgentOutcome::failure(diagnostic, start.elapsed())
        }
    }
}

/// Last `max_bytes` of `text`, cut on a char boundary
fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
