// Error taxonomy for orchestration runs

use thiserror::Error;

/// Errors raised by the orchestrator and its components.
///
/// Per-item failures (`Workspace`, `AgentTimeout`, `MergeConflict`,
/// `RetryExhausted`) are contained by the worker pool and end up in the run
/// report. Only `ResourceExhaustion` and the pre-run input errors abort a run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Workspace error for issue {item_id}: {message}")]
    Workspace { item_id: String, message: String },

    #[error("Agent for issue {item_id} exceeded its {timeout_secs}s bound")]
    AgentTimeout { item_id: String, timeout_secs: u64 },

    #[error("Merge conflict for issue {item_id} in {} file(s): {}", paths.len(), paths.join(", "))]
    MergeConflict { item_id: String, paths: Vec<String> },

    #[error("Issue {item_id} exhausted its {retries} retries")]
    RetryExhausted { item_id: String, retries: u32 },

    #[error("Scope {requested:?} conflicts with scope {held:?} held by {holder}")]
    ScopeConflict {
        holder: String,
        held: Vec<String>,
        requested: Vec<String>,
    },

    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid dependency graph: {0}")]
    Graph(#[from] crate::orchestrator::graph::GraphError),

    #[error("State persistence error: {0}")]
    State(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Whether this error aborts the whole run rather than a single issue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ResourceExhaustion(_)
                | OrchestratorError::Config(_)
                | OrchestratorError::Graph(_)
                | OrchestratorError::State(_)
                | OrchestratorError::ScopeConflict { .. }
        )
    }

    pub(crate) fn workspace(item_id: &str, message: impl std::fmt::Display) -> Self {
        OrchestratorError::Workspace {
            item_id: item_id.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_item_errors_are_not_fatal() {
        assert!(!OrchestratorError::workspace("ISS-1", "disk full").is_fatal());
        assert!(!OrchestratorError::AgentTimeout {
            item_id: "ISS-1".to_string(),
            timeout_secs: 30,
        }
        .is_fatal());
        assert!(!OrchestratorError::MergeConflict {
            item_id: "ISS-1".to_string(),
            paths: vec!["src/lib.rs".to_string()],
        }
        .is_fatal());
        assert!(!OrchestratorError::RetryExhausted {
            item_id: "ISS-1".to_string(),
            retries: 3,
        }
        .is_fatal());
    }

    #[test]
    fn test_resource_exhaustion_is_fatal() {
        assert!(OrchestratorError::ResourceExhaustion("no workers".to_string()).is_fatal());
    }

    #[test]
    fn test_merge_conflict_message_lists_paths() {
        let err = OrchestratorError::MergeConflict {
            item_id: "ISS-7".to_string(),
            paths: vec!["a.txt".to_string(), "b.txt".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Merge conflict for issue ISS-7 in 2 file(s): a.txt, b.txt"
        );
    }
}
