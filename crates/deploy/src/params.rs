//! Typed parameters handed from one stage to the next.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use derive_more::{Deref, From};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeployError, Result},
    stage::{StageDefinition, StageId},
};

/// Delimiter for multi-line values in an outputs file.
const MULTILINE_DELIMITER: &str = "STAGEHAND_EOF";

/// Named string values passed between stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Deref, From)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, String>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Merge `other` into `self`, `other` winning on conflicts.
    pub fn extend(&mut self, other: ParameterSet) {
        self.0.extend(other.0);
    }

    /// Parse a `NAME=value` assignment.
    pub fn parse_assignment(assignment: &str) -> Result<(String, String)> {
        let (name, value) = assignment.split_once('=').ok_or_else(|| {
            DeployError::InvalidInvocation(format!(
                "expected NAME=value, got `{}`",
                assignment
            ))
        })?;
        let name = name.trim();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(DeployError::InvalidInvocation(format!(
                "invalid parameter name in `{}`",
                assignment
            )));
        }
        Ok((name.to_string(), value.to_string()))
    }

    /// Build a set from `NAME=value` assignments.
    pub fn from_assignments<I, S>(assignments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for assignment in assignments {
            let (name, value) = Self::parse_assignment(assignment.as_ref())?;
            set.insert(name, value);
        }
        Ok(set)
    }

    /// Read a parameters file, either a JSON object or `NAME=value` lines.
    ///
    /// Blank lines and lines starting with `#` are ignored in the line format.
    pub fn read_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters file {}", path.display()))?;

        if content.trim_start().starts_with('{') {
            let values: BTreeMap<String, String> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse parameters file {}", path.display()))?;
            return Ok(Self(values));
        }

        Self::from_assignments(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        )
    }

    /// Append every value to an outputs file as `NAME=value` lines.
    pub fn append_outputs(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open outputs file {}", path.display()))?;

        for (name, value) in &self.0 {
            if value.contains('\n') {
                writeln!(file, "{name}<<{MULTILINE_DELIMITER}\n{value}\n{MULTILINE_DELIMITER}")?;
            } else {
                writeln!(file, "{name}={value}")?;
            }
        }

        tracing::debug!(path = %path.display(), count = self.0.len(), "Wrote stage outputs");
        Ok(())
    }
}

/// Where a run's stage inputs come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterSource {
    /// Values published by upstream stages of the same run.
    Propagated,
    /// Values handed in by whoever invoked the stage.
    Supplied(ParameterSet),
}

/// Carries published parameters between the stages of a single run.
#[derive(Debug)]
pub struct ParameterPropagator {
    source: ParameterSource,
    published: HashMap<StageId, ParameterSet>,
}

impl ParameterPropagator {
    pub fn new(source: ParameterSource) -> Self {
        Self {
            source,
            published: HashMap::new(),
        }
    }

    /// Make `values` visible to stages depending on `stage`.
    pub fn publish(&mut self, stage: &StageId, values: ParameterSet) {
        tracing::info!(stage = %stage, names = ?values.keys().collect::<Vec<_>>(), "Publishing parameters");
        self.published.entry(stage.clone()).or_default().extend(values);
    }

    /// Everything published during the run, merged.
    pub fn outputs(&self) -> ParameterSet {
        let mut merged = ParameterSet::new();
        for values in self.published.values() {
            merged.extend(values.clone());
        }
        merged
    }

    /// The declared inputs of `stage`.
    ///
    /// The result only ever holds the stage's declared inputs, whatever the
    /// source, and every declared input must be present.
    pub fn consume(&self, stage: &StageDefinition) -> Result<ParameterSet> {
        let available = match &self.source {
            ParameterSource::Supplied(values) => values.clone(),
            ParameterSource::Propagated => {
                let mut visible = ParameterSet::new();
                for dependency in &stage.depends_on {
                    if let Some(values) = self.published.get(dependency) {
                        visible.extend(values.clone());
                    }
                }
                visible
            }
        };

        let mut inputs = ParameterSet::new();
        for name in &stage.inputs {
            let value = available
                .get(name)
                .ok_or_else(|| DeployError::MissingParameter {
                    stage: stage.id.clone(),
                    name: name.clone(),
                })?;
            inputs.insert(name.clone(), value.clone());
        }
        Ok(inputs)
    }
}
