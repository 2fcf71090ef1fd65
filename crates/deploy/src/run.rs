//! Pipeline run identity.

use chrono::{DateTime, Utc};
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// What caused a pipeline run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TriggerCause {
    /// A push to a branch.
    Push,
    /// A pull request under review.
    PullRequest,
    /// A human dispatched the pipeline with explicit parameters.
    Manual,
    /// Another pipeline called this one with typed parameters.
    Chained,
}

impl TriggerCause {
    /// Causes that carry a changed-path list and a branch (source-control events).
    pub fn is_source_event(&self) -> bool {
        matches!(self, Self::Push | Self::PullRequest)
    }
}

/// Identifier assigned to a run by the execution platform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
)]
pub struct RunId(pub u64);

/// One end-to-end execution of the pipeline.
///
/// Fields are private: a run never changes after it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRun {
    run_id: RunId,
    cause: TriggerCause,
    revision: String,
    branch: String,
    changed_paths: Vec<String>,
    started_at: DateTime<Utc>,
}

impl PipelineRun {
    /// Create a run. Changed paths are normalized (leading `./` removed).
    pub fn new(
        run_id: impl Into<RunId>,
        cause: TriggerCause,
        revision: impl Into<String>,
        branch: impl Into<String>,
        changed_paths: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            cause,
            revision: revision.into(),
            branch: branch.into(),
            changed_paths: changed_paths
                .into_iter()
                .map(|p| {
                    let p: String = p.into();
                    p.trim_start_matches("./").to_string()
                })
                .collect(),
            started_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn cause(&self) -> TriggerCause {
        self.cause
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn changed_paths(&self) -> &[String] {
        &self.changed_paths
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
