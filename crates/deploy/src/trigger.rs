//! Stage gating.
//!
//! [`resolve`] is a pure function: the same stage and input always produce the
//! same [`Gate`].

use std::collections::HashMap;
use std::fmt;

use crate::run::TriggerCause;
use crate::stage::{StageDefinition, StageId, StageStatus};

/// How upstream completion is signalled to a stage.
#[derive(Debug, Clone, Copy)]
pub enum UpstreamSignal<'a> {
    /// Terminal statuses of the stages that already finished in this run.
    Statuses(&'a HashMap<StageId, StageStatus>),
    /// The caller supplied the stage's parameters directly, bypassing producers.
    Supplied,
}

/// Everything the resolver looks at besides the stage itself.
#[derive(Debug, Clone, Copy)]
pub struct TriggerInput<'a> {
    pub cause: TriggerCause,
    pub branch: &'a str,
    pub changed_paths: &'a [String],
    pub upstream: UpstreamSignal<'a>,
}

/// Why a stage was not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A push-only stage never runs for code under review.
    ReviewTrigger,
    /// The stage's execution mode does not admit the cause.
    CauseNotAccepted(TriggerCause),
    /// The target branch is not in the stage's branch filter.
    BranchExcluded(String),
    /// A dependency has not succeeded.
    UpstreamNotSucceeded {
        upstream: StageId,
        status: Option<StageStatus>,
    },
    /// None of the changed paths fall under the stage's filters.
    NoMatchingPaths,
}

impl SkipReason {
    /// The failed dependency, if this skip is caused by an upstream failure.
    pub fn failed_upstream(&self) -> Option<&StageId> {
        match self {
            Self::UpstreamNotSucceeded {
                upstream,
                status: Some(StageStatus::Failed),
            } => Some(upstream),
            _ => None,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReviewTrigger => write!(f, "push-only stage does not run for pull requests"),
            Self::CauseNotAccepted(cause) => write!(f, "trigger `{}` not accepted", cause),
            Self::BranchExcluded(branch) => write!(f, "branch `{}` excluded", branch),
            Self::UpstreamNotSucceeded { upstream, status } => match status {
                Some(status) => write!(f, "upstream `{}` {}", upstream, status),
                None => write!(f, "upstream `{}` did not run", upstream),
            },
            Self::NoMatchingPaths => write!(f, "no changed path matches the path filters"),
        }
    }
}

/// Decision for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Run,
    Skip(SkipReason),
}

impl Gate {
    pub fn should_run(&self) -> bool {
        matches!(self, Self::Run)
    }
}

/// Decide whether `stage` runs.
pub fn resolve(stage: &StageDefinition, input: &TriggerInput<'_>) -> Gate {
    if input.cause == TriggerCause::PullRequest
        && stage.triggers.contains(&TriggerCause::Push)
        && !stage.triggers.contains(&TriggerCause::PullRequest)
    {
        return Gate::Skip(SkipReason::ReviewTrigger);
    }

    if !stage.accepts(input.cause) {
        return Gate::Skip(SkipReason::CauseNotAccepted(input.cause));
    }

    if input.cause.is_source_event()
        && !stage.branches.is_empty()
        && !stage.branches.iter().any(|b| b == input.branch)
    {
        return Gate::Skip(SkipReason::BranchExcluded(input.branch.to_string()));
    }

    if let UpstreamSignal::Statuses(statuses) = input.upstream {
        for upstream in &stage.depends_on {
            let status = statuses.get(upstream).copied();
            if status != Some(StageStatus::Succeeded) {
                return Gate::Skip(SkipReason::UpstreamNotSucceeded {
                    upstream: upstream.clone(),
                    status,
                });
            }
        }
    }

    if input.cause.is_source_event()
        && !stage.path_filters.is_empty()
        && !input
            .changed_paths
            .iter()
            .any(|path| stage.path_filters.iter().any(|f| f.matches(path)))
    {
        return Gate::Skip(SkipReason::NoMatchingPaths);
    }

    Gate::Run
}
