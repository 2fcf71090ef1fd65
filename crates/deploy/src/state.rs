//! JSON records kept in the state directory between runs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Serialize, de::DeserializeOwned};

/// Path of an environment's record named `name` inside `state_dir`.
pub(crate) fn environment_file(state_dir: &Path, environment: &str, name: &str) -> PathBuf {
    state_dir.join(format!("{}.{}.json", environment, name))
}

/// Read the record at `path`, or the default when the file does not exist yet.
pub(crate) fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write `value` to `path` as pretty JSON, creating parent directories.
pub(crate) fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize state record")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}
