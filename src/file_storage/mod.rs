//! File-based storage helpers
//!
//! Persisted run state is plain JSON. Writers go through `atomic_write`
//! (temp file + rename) so a crash mid-write never leaves a truncated state
//! file for the next process to trip over. Scope lock records are created
//! exclusively by the scope lock manager instead.

use std::fs;
use std::path::Path;

/// Common file operations result type
pub type FileResult<T> = Result<T, String>;

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .map_err(|e| format!("Failed to create directory {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    let temp_path = path.with_extension(format!("{}.tmp", std::process::id()));

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content)
        .map_err(|e| format!("Failed to write temp file {:?}: {}", temp_path, e))?;

    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to rename {:?} to {:?}: {}", temp_path, path, e))?;

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read file {:?}: {}", path, e))?;

    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse JSON from {:?}: {}", path, e))
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> FileResult<()> {
    let content = serde_json::to_string_pretty(data)
        .map_err(|e| format!("Failed to serialize to JSON: {}", e))?;

    atomic_write(path, &content)
}
