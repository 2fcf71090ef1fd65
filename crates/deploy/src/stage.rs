//! Stage definitions and terminal statuses.

use derive_more::{Deref, Display, From};
use serde::{Deserialize, Serialize};

use crate::run::TriggerCause;

/// Name of a stage, e.g. `deploy-frontend`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Deref, Display, From,
)]
#[serde(transparent)]
pub struct StageId(String);

impl From<&str> for StageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How a stage may be entered.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Runs as part of automatic runs for the listed trigger causes.
    #[default]
    Automatic,
    /// Runs only when a human dispatches it.
    ManualOnly,
    /// Runs chained from an upstream stage, or when invoked directly.
    Callable,
}

/// A prefix that activates a stage when a changed path falls under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PathFilter {
    prefix: String,
    directory: bool,
}

impl PathFilter {
    /// Parse a filter such as `backend/**`, `backend/` or `backend`.
    pub fn new(pattern: impl AsRef<str>) -> Self {
        let pattern = pattern.as_ref().trim().trim_start_matches("./");
        let stripped = pattern.trim_end_matches("**");
        let directory = stripped.len() != pattern.len() || stripped.ends_with('/');
        Self {
            prefix: stripped.trim_end_matches('/').to_string(),
            directory,
        }
    }

    /// Returns true if `path` lies under this filter.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        if self.prefix.is_empty() {
            return true;
        }

        match path.strip_prefix(self.prefix.as_str()) {
            Some("") => !self.directory,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    }
}

impl From<String> for PathFilter {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<PathFilter> for String {
    fn from(value: PathFilter) -> Self {
        if value.directory {
            format!("{}/**", value.prefix)
        } else {
            value.prefix
        }
    }
}

/// Static description of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: StageId,
    /// Stages that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<StageId>,
    /// Changed-path prefixes that activate the stage. Empty means always.
    #[serde(default)]
    pub path_filters: Vec<PathFilter>,
    /// Trigger causes this stage reacts to.
    #[serde(default)]
    pub triggers: Vec<TriggerCause>,
    /// Branches this stage reacts to. Empty means any branch.
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Parameters the stage consumes.
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl StageDefinition {
    pub fn new(id: impl Into<StageId>) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            path_filters: Vec::new(),
            triggers: Vec::new(),
            branches: Vec::new(),
            mode: ExecutionMode::Automatic,
            inputs: Vec::new(),
        }
    }

    pub fn depends_on(mut self, stage: impl Into<StageId>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    pub fn path_filter(mut self, pattern: impl AsRef<str>) -> Self {
        self.path_filters.push(PathFilter::new(pattern));
        self
    }

    pub fn triggers(mut self, causes: impl IntoIterator<Item = TriggerCause>) -> Self {
        self.triggers.extend(causes);
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.branches.push(branch.into());
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    /// Returns true if the execution mode admits the given cause.
    pub fn accepts(&self, cause: TriggerCause) -> bool {
        match self.mode {
            ExecutionMode::Automatic => self.triggers.contains(&cause),
            ExecutionMode::ManualOnly => cause == TriggerCause::Manual,
            ExecutionMode::Callable => {
                matches!(cause, TriggerCause::Manual | TriggerCause::Chained)
                    || self.triggers.contains(&cause)
            }
        }
    }
}

/// Terminal status of a stage within one run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_filter_matches_nested_paths() {
        let filter = PathFilter::new("backend/**");
        assert!(filter.matches("backend/order_service/app/main.py"));
        assert!(filter.matches("./backend/x"));
        assert!(!filter.matches("frontend/x.js"));
        assert!(!filter.matches("backend-old/x"));
        assert!(!filter.matches("backend"));
    }

    #[test]
    fn test_bare_filter_matches_file_or_directory() {
        let filter = PathFilter::new("docker-compose.yml");
        assert!(filter.matches("docker-compose.yml"));
        assert!(!filter.matches("docker-compose.yml.bak"));

        let dir = PathFilter::new("k8s");
        assert!(dir.matches("k8s/product.yaml"));
    }

    #[test]
    fn test_filter_serde_form() {
        let filter: PathFilter = "frontend/".to_string().into();
        assert_eq!(String::from(filter), "frontend/**");
    }

    #[test]
    fn test_callable_accepts_direct_invocations() {
        let stage = StageDefinition::new("deploy-frontend")
            .mode(ExecutionMode::Callable)
            .triggers([TriggerCause::Push]);
        assert!(stage.accepts(TriggerCause::Manual));
        assert!(stage.accepts(TriggerCause::Chained));
        assert!(stage.accepts(TriggerCause::Push));
        assert!(!stage.accepts(TriggerCause::PullRequest));

        let manual = StageDefinition::new("rollback").mode(ExecutionMode::ManualOnly);
        assert!(manual.accepts(TriggerCause::Manual));
        assert!(!manual.accepts(TriggerCause::Chained));
    }
}
