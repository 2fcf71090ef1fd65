//! Per-environment run lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;

use crate::error::{DeployError, Result};

/// Exclusive advisory lock on `{state_dir}/{environment}.lock`.
///
/// Held for the lifetime of a run; released when dropped.
#[derive(Debug)]
pub struct EnvironmentLock {
    file: File,
    path: PathBuf,
}

impl EnvironmentLock {
    /// Take the lock or fail immediately with [`DeployError::EnvironmentBusy`].
    pub fn acquire(state_dir: &Path, environment: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;

        let path = state_dir.join(format!("{}.lock", environment));
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            return Err(lock_error(environment, &path, e));
        }

        file.set_len(0).context("Failed to truncate lock file")?;
        writeln!(file, "{}", std::process::id()).context("Failed to write lock file")?;

        tracing::debug!(path = %path.display(), "Environment lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Contention means another run holds the environment; anything else is an IO failure.
fn lock_error(environment: &str, path: &Path, error: std::io::Error) -> DeployError {
    if error.raw_os_error().is_some()
        && error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
    {
        return DeployError::EnvironmentBusy(environment.to_string());
    }

    anyhow::Error::new(error)
        .context(format!("Failed to lock {}", path.display()))
        .into()
}

impl Drop for EnvironmentLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to release environment lock");
        }
    }
}
