//! Dependency graph input
//!
//! The graph file lists issues with their priority and blockers:
//!
//! ```yaml
//! issues:
//!   - id: ISS-1
//!     priority: 2
//!   - id: ISS-2
//!     blockedBy: [ISS-1]
//! ```

use super::types::WorkItem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Error types for dependency graph validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Cycle detected: {}", .0.join(" → "))]
    CycleDetected(Vec<String>),

    #[error("Issue '{from}' depends on non-existent '{to}'")]
    MissingDependency { from: String, to: String },

    #[error("Issue '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Issue '{0}' is listed more than once")]
    DuplicateIssue(String),

    #[error("Issue id must not be empty")]
    EmptyId,

    #[error("Failed to read graph file: {0}")]
    Parse(String),
}

/// One issue entry of the graph file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueSpec {
    pub id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, alias = "blocked_by")]
    pub blocked_by: Vec<String>,
}

/// Validated issue dependency graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub issues: Vec<IssueSpec>,
}

impl DependencyGraph {
    /// Build and validate a graph from issue entries
    pub fn new(issues: Vec<IssueSpec>) -> Result<Self, GraphError> {
        let graph = Self { issues };
        graph.validate()?;
        Ok(graph)
    }

    /// Build from a mapping of issue id to blocker ids (priority 0)
    pub fn from_blockers(blockers: BTreeMap<String, Vec<String>>) -> Result<Self, GraphError> {
        Self::new(
            blockers
                .into_iter()
                .map(|(id, blocked_by)| IssueSpec {
                    id,
                    priority: 0,
                    blocked_by,
                })
                .collect(),
        )
    }

    /// Load a graph file; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_file(path: &Path) -> Result<Self, GraphError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Parse(format!("{}: {}", path.display(), e)))?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let graph: DependencyGraph = if is_json {
            serde_json::from_str(&content)
                .map_err(|e| GraphError::Parse(format!("{}: {}", path.display(), e)))?
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| GraphError::Parse(format!("{}: {}", path.display(), e)))?
        };

        graph.validate()?;
        Ok(graph)
    }

    /// Check ids, references and cycles
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids: HashSet<&str> = HashSet::new();
        for issue in &self.issues {
            if issue.id.trim().is_empty() {
                return Err(GraphError::EmptyId);
            }
            if !ids.insert(issue.id.as_str()) {
                return Err(GraphError::DuplicateIssue(issue.id.clone()));
            }
        }

        for issue in &self.issues {
            for dep in &issue.blocked_by {
                if dep == &issue.id {
                    return Err(GraphError::SelfDependency(issue.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(GraphError::MissingDependency {
                        from: issue.id.clone(),
                        to: dep.clone(),
                    });
                }
            }
        }

        let depends_on: HashMap<&str, &[String]> = self
            .issues
            .iter()
            .map(|issue| (issue.id.as_str(), issue.blocked_by.as_slice()))
            .collect();

        let mut visited: HashSet<&str> = HashSet::new();
        let mut in_path: HashSet<&str> = HashSet::new();
        let mut path: Vec<&str> = Vec::new();

        for issue in &self.issues {
            if !visited.contains(issue.id.as_str()) {
                if let Some(cycle) = dfs_cycle_detect(
                    &depends_on,
                    issue.id.as_str(),
                    &mut visited,
                    &mut in_path,
                    &mut path,
                ) {
                    return Err(GraphError::CycleDetected(cycle));
                }
            }
        }

        Ok(())
    }

    /// Work items in file order, with their reverse edges filled in
    pub fn to_work_items(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .issues
            .iter()
            .map(|issue| {
                WorkItem::new(issue.id.clone())
                    .with_priority(issue.priority)
                    .blocked_by(issue.blocked_by.iter().cloned())
            })
            .collect();

        let index: HashMap<String, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.clone(), i))
            .collect();

        for issue in &self.issues {
            for dep in &issue.blocked_by {
                if let Some(&i) = index.get(dep) {
                    items[i].unblocks.insert(issue.id.clone());
                }
            }
        }

        items
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }
}

fn dfs_cycle_detect<'a>(
    depends_on: &HashMap<&'a str, &'a [String]>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    in_path: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    in_path.insert(node);
    path.push(node);

    if let Some(deps) = depends_on.get(node) {
        for dep in deps.iter() {
            let dep = dep.as_str();
            if in_path.contains(dep) {
                let cycle_start = path.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[cycle_start..].iter().map(|s| s.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }

            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle_detect(depends_on, dep, visited, in_path, path) {
                    return Some(cycle);
                }
            }
        }
    }

    in_path.remove(node);
    path.pop();
    None
}
