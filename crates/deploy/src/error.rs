//! Error taxonomy for pipeline stages.
//!
//! Every variant is fatal to the stage that raised it and to every stage that
//! depends on it. Skipping a stage on purpose is not an error, see
//! [`crate::trigger::Gate`].

use std::collections::BTreeSet;

use thiserror::Error;

use crate::stage::StageId;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors that can fail a pipeline stage.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A dependency of the stage did not succeed.
    #[error("upstream stage `{upstream}` failed")]
    UpstreamFailed { upstream: StageId },

    /// The registry rejected an image push.
    #[error("failed to push image {image}: {reason}")]
    RegistryPushFailed { image: String, reason: String },

    /// The revision/run pair does not form a valid registry tag.
    #[error("invalid image tag `{0}`")]
    InvalidTag(String),

    /// An immutable tag was requested twice for the same service.
    #[error("immutable tag `{tag}` was already issued for service `{service}`")]
    TagReused { service: String, tag: String },

    /// The service is not declared in the configuration.
    #[error("unknown service `{0}`")]
    UnknownService(String),

    /// A resource in a resource set could not be applied.
    #[error("provisioning failed in resource set `{failed_set}` at {resource}: {reason}")]
    ProvisioningFailed {
        failed_set: String,
        resource: String,
        reason: String,
    },

    /// Some endpoints never received an external address.
    #[error(
        "timed out after {attempts} attempt(s) waiting for endpoints: {}",
        join(.unresolved)
    )]
    DiscoveryTimeout {
        unresolved: BTreeSet<String>,
        attempts: u32,
    },

    /// A discovered endpoint never answered its health check.
    #[error("endpoint for `{service}` is unhealthy: {reason}")]
    EndpointUnhealthy { service: String, reason: String },

    /// A declared stage input was not provided.
    #[error("stage `{stage}` is missing required parameter `{name}`")]
    MissingParameter { stage: StageId, name: String },

    /// Placeholders survived injection.
    #[error("unresolved placeholders after injection: {}", join(.placeholders))]
    UnresolvedPlaceholder { placeholders: BTreeSet<String> },

    /// The cluster control plane rejected the login.
    #[error("cluster authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    /// Another run holds the environment lock.
    #[error("environment `{0}` already has a run in flight")]
    EnvironmentBusy(String),

    /// The stage graph or its configuration is inconsistent.
    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// A stage was invoked in a way its execution mode does not allow.
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Returns true if this error only reports that an upstream stage failed.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::UpstreamFailed { .. })
    }
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}
