//! stagehand-deploy - Deployment pipeline coordinator.
//!
//! This crate decides which delivery stages of a run may execute, applies
//! infrastructure in dependency order, discovers the external addresses of
//! freshly deployed services, and hands them to downstream stages that inject
//! them into runtime configuration.

mod artifact;
pub use artifact::{
    Artifact, ArtifactLedger, IssuedTags, LATEST_TAG, ServiceImage, immutable_tag,
};

mod cluster;
pub use cluster::{ApplyOutcome, ClusterApi, ClusterSession, ServiceStatus};

mod config;
pub use config::{
    BuildConfig, CONFIG_FILENAME, DEFAULT_STATE_DIR, DiscoveryTarget, FrontendConfig, ManifestRef,
    PipelineConfig, ResourceSetConfig, TestConfig,
};

mod coordinator;
pub use coordinator::{Coordinator, Invocation, RunReport, StageOutcome, StageReport};

mod discovery;
pub use discovery::{Clock, Endpoint, EndpointPoller, Endpoints, PollPolicy, TokioClock};

mod error;
pub use error::{DeployError, Result};

mod health;
pub use health::HealthCheck;

mod inject;
pub use inject::{ConfigInjector, DEFAULT_PLACEHOLDER_PATTERN};

mod kubectl;
pub use kubectl::{AzureLogin, ClusterConfig, KubectlCluster};

mod lock;
pub use lock::EnvironmentLock;

mod params;
pub use params::{ParameterPropagator, ParameterSet, ParameterSource};

pub mod pipeline;
pub use pipeline::{PipelineDefinition, PipelineStage, StageAction};

mod process;

mod provision;
pub use provision::{AppliedLedger, ProvisionReport, ProvisioningSequencer, SetOutcome};

mod registry;
pub use registry::{DockerRegistry, ImageRef, Registry, RegistryConfig};

mod resources;
pub use resources::{ResourceDefinition, ResourceKind, ResourceSet};

mod run;
pub use run::{PipelineRun, RunId, TriggerCause};

mod stage;
pub use stage::{ExecutionMode, PathFilter, StageDefinition, StageId, StageStatus};

mod state;

pub mod trigger;
pub use trigger::{Gate, SkipReason, TriggerInput, UpstreamSignal};

#[cfg(test)]
mod testing;
