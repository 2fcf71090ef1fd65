use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::Rng;
use stagehand_deploy::{CONFIG_FILENAME, ParameterSet, PipelineRun, TriggerCause};
use tracing::level_filters::LevelFilter;

/// How a single stage is entered directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum DirectMode {
    /// Dispatched by a human.
    Manual,
    /// Called from another workflow.
    Chained,
}

impl From<DirectMode> for TriggerCause {
    fn from(mode: DirectMode) -> Self {
        match mode {
            DirectMode::Manual => TriggerCause::Manual,
            DirectMode::Chained => TriggerCause::Chained,
        }
    }
}

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(
    author,
    version,
    about = "Coordinate a multi-stage build, provision and deploy pipeline"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "STAGEHAND_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the pipeline configuration, or a directory containing Stagehand.toml.
    #[arg(short, long, global = true, alias = "conf", env = "STAGEHAND_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Evaluate the whole stage graph for a source event.
    Run {
        #[clap(flatten)]
        event: EventArgs,
        #[clap(flatten)]
        exec: ExecArgs,
    },

    /// Run one stage with caller-supplied parameters.
    Invoke {
        /// The stage to run, e.g. `deploy-frontend`.
        stage: String,

        /// Whether the stage is dispatched by a human or called from another workflow.
        #[arg(long, env = "STAGEHAND_MODE", default_value_t = DirectMode::Manual)]
        mode: DirectMode,

        /// A parameter as NAME=value. May be repeated.
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// A file of NAME=value lines or a JSON object. `--param` values win.
        #[arg(long, env = "STAGEHAND_PARAMS_FILE")]
        params_file: Option<PathBuf>,

        #[clap(flatten)]
        source: SourceArgs,
        #[clap(flatten)]
        exec: ExecArgs,
    },

    /// Write a starter configuration file.
    Init {
        /// Environment name written into the configuration.
        #[arg(long, default_value = "production")]
        environment: String,

        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },

    /// Print the gate decision of every stage without executing anything.
    Plan {
        #[clap(flatten)]
        event: EventArgs,
    },
}

/// Identity of the revision being delivered.
#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// Source revision, usually a commit SHA.
    #[arg(long, env = "STAGEHAND_REVISION")]
    pub revision: String,

    /// Target branch of the run.
    #[arg(long, env = "STAGEHAND_BRANCH")]
    pub branch: String,

    /// Platform run identifier. A random one is generated when missing.
    #[arg(long, env = "STAGEHAND_RUN_ID")]
    pub run_id: Option<u64>,
}

impl SourceArgs {
    pub fn run_id(&self) -> u64 {
        self.run_id
            .unwrap_or_else(|| rand::rng().random_range(1..=u64::from(u32::MAX)))
    }
}

/// A source event: cause, revision and changed paths.
#[derive(Debug, Clone, Args)]
pub struct EventArgs {
    /// What triggered the run.
    #[arg(long, env = "STAGEHAND_CAUSE", default_value_t = TriggerCause::Push)]
    pub cause: TriggerCause,

    #[clap(flatten)]
    pub source: SourceArgs,

    /// A changed path, relative to the repository root. May be repeated or comma separated.
    #[arg(long = "changed-path", env = "STAGEHAND_CHANGED_PATHS", value_delimiter = ',')]
    pub changed_paths: Vec<String>,

    /// File with one changed path per line, e.g. the output of `git diff --name-only`.
    #[arg(long, env = "STAGEHAND_CHANGED_PATHS_FILE")]
    pub changed_paths_file: Option<PathBuf>,
}

impl EventArgs {
    pub fn to_run(&self) -> Result<PipelineRun> {
        let mut paths = self.changed_paths.clone();
        if let Some(file) = &self.changed_paths_file {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read changed paths from {}", file.display()))?;
            paths.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }

        Ok(PipelineRun::new(
            self.source.run_id(),
            self.cause,
            self.source.revision.clone(),
            self.source.branch.clone(),
            paths,
        ))
    }
}

/// Options for commands that execute stages.
#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    /// Append published parameters to this file as NAME=value lines.
    #[arg(long, env = "STAGEHAND_OUTPUTS")]
    pub outputs: Option<PathBuf>,

    /// Re-apply resource sets even when they are unchanged.
    #[arg(long, env = "STAGEHAND_FORCE")]
    pub force: bool,
}

/// Merge a parameters file with `--param` assignments, assignments winning.
pub fn collect_parameters(
    params: &[String],
    params_file: Option<&PathBuf>,
) -> Result<ParameterSet> {
    let mut parameters = match params_file {
        Some(path) => ParameterSet::read_file(path)?,
        None => ParameterSet::new(),
    };
    parameters.extend(ParameterSet::from_assignments(params)?);
    Ok(parameters)
}
