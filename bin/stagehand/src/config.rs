//! Layered configuration loading.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use stagehand_deploy::{CONFIG_FILENAME, PipelineConfig};

/// Prefix of environment variables overriding configuration values.
const ENV_PREFIX: &str = "STAGEHAND_";

/// Variables read by the CLI itself rather than the configuration.
const CLI_VARIABLES: &[&str] = &[
    "verbosity",
    "config",
    "cause",
    "revision",
    "branch",
    "run_id",
    "changed_paths",
    "changed_paths_file",
    "mode",
    "params_file",
    "outputs",
    "force",
];

/// A loaded configuration together with the directory relative paths resolve against.
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub base_dir: PathBuf,
}

impl LoadedConfig {
    /// State directory, resolved against the configuration directory.
    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(&self.config.state_dir)
    }
}

/// Resolve `path` to the configuration file it names.
pub fn config_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CONFIG_FILENAME)
    } else {
        path.to_path_buf()
    }
}

/// User-wide defaults, e.g. `~/.config/stagehand/Stagehand.toml`.
fn user_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stagehand").join(CONFIG_FILENAME))
}

/// User defaults, then the project file, then `STAGEHAND_*` variables.
///
/// Nested keys are separated by `__`, e.g.
/// `STAGEHAND_CLUSTER__AZURE__CLIENT_SECRET`.
fn figment(file: &Path) -> Figment {
    let mut figment = Figment::new();
    if let Some(user) = user_config_file() {
        figment = figment.merge(Toml::file(user));
    }
    figment
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).ignore(CLI_VARIABLES).split("__"))
}

/// Load the pipeline configuration named by `path`.
pub fn load(path: &Path) -> Result<LoadedConfig> {
    let file = config_file(path);
    if !file.exists() {
        anyhow::bail!(
            "Configuration file not found: {} (run `stagehand init` to create one)",
            file.display()
        );
    }

    let config: PipelineConfig = figment(&file)
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", file.display()))?;

    let base_dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    tracing::info!(
        path = %file.display(),
        environment = %config.environment,
        namespace = %config.cluster.namespace,
        "Configuration loaded"
    );

    Ok(LoadedConfig { config, base_dir })
}
