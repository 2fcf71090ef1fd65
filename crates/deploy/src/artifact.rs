//! Artifact ledger: immutable image identities per build.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{DeployError, Result},
    registry::{ImageRef, Registry, RegistryConfig},
    run::RunId,
    state,
};

/// Record name of the issued-tag ledger, stored as `{environment}.issued-tags.json`.
const ISSUED_TAGS: &str = "issued-tags";

/// Tag that always points at the most recent build of a service.
pub const LATEST_TAG: &str = "latest";

/// Maximum tag length accepted by OCI registries.
const MAX_TAG_LEN: usize = 128;

/// How a service's image is named locally and in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceImage {
    /// Logical service name, e.g. "product-service".
    pub name: String,
    /// Repository name inside the registry.
    pub repository: String,
    /// Image produced by the build toolchain, e.g. "product-service:ci".
    pub local_image: String,
    /// Placeholder replaced with this image's reference in deployment manifests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// A published build of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub service: String,
    pub revision: String,
    pub run_id: RunId,
    /// Mutable reference moved to every new build.
    pub latest: ImageRef,
    /// Reference unique to this (revision, run) pair.
    pub immutable: ImageRef,
}

/// Build the immutable tag for a revision and run.
///
/// The tag is `{revision}-{run_id}`; revisions that would produce an invalid
/// registry tag are rejected.
pub fn immutable_tag(revision: &str, run_id: RunId) -> Result<String> {
    let tag = format!("{}-{}", revision, run_id);

    let valid_first = revision
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_rest = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if !valid_first || !valid_rest || tag.len() > MAX_TAG_LEN {
        return Err(DeployError::InvalidTag(tag));
    }

    Ok(tag)
}

/// Immutable tags already published, keyed by fully qualified repository.
///
/// Persisted in the state directory so a tag stays claimed across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedTags {
    repositories: BTreeMap<String, BTreeSet<String>>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl IssuedTags {
    /// A record that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the tags issued for `environment` from its state directory.
    pub fn for_environment(state_dir: &Path, environment: &str) -> anyhow::Result<Self> {
        let path = state::environment_file(state_dir, environment, ISSUED_TAGS);
        let mut issued: Self = state::load_or_default(&path)?;
        issued.path = Some(path);
        Ok(issued)
    }

    pub fn contains(&self, image: &ImageRef) -> bool {
        self.repositories
            .get(&image.repository)
            .is_some_and(|tags| tags.contains(&image.tag))
    }

    fn record(&mut self, image: &ImageRef) -> anyhow::Result<()> {
        self.repositories
            .entry(image.repository.clone())
            .or_default()
            .insert(image.tag.clone());
        match &self.path {
            Some(path) => state::save(path, self),
            None => Ok(()),
        }
    }
}

/// Records builds and publishes their tags.
pub struct ArtifactLedger<'r, R> {
    registry: &'r R,
    config: RegistryConfig,
    images: BTreeMap<String, ServiceImage>,
    issued: IssuedTags,
    artifacts: BTreeMap<String, Artifact>,
}

impl<'r, R: Registry> ArtifactLedger<'r, R> {
    pub fn new(
        registry: &'r R,
        config: RegistryConfig,
        images: impl IntoIterator<Item = ServiceImage>,
        issued: IssuedTags,
    ) -> Self {
        Self {
            registry,
            config,
            images: images.into_iter().map(|i| (i.name.clone(), i)).collect(),
            issued,
            artifacts: BTreeMap::new(),
        }
    }

    /// Give back the issued tags, including the ones claimed by this ledger.
    pub fn into_issued(self) -> IssuedTags {
        self.issued
    }

    /// Record a build and push its immutable tag, then `latest`.
    ///
    /// A push failure is returned as [`DeployError::RegistryPushFailed`]
    /// and the build is not recorded.
    pub async fn record_build(
        &mut self,
        service: &str,
        revision: &str,
        run_id: RunId,
    ) -> Result<Artifact> {
        let image = self
            .images
            .get(service)
            .ok_or_else(|| DeployError::UnknownService(service.to_string()))?;

        let tag = immutable_tag(revision, run_id)?;
        let repository = self.config.repository(&image.repository);
        let artifact = Artifact {
            service: service.to_string(),
            revision: revision.to_string(),
            run_id,
            latest: ImageRef::new(repository.clone(), LATEST_TAG),
            immutable: ImageRef::new(repository, tag.clone()),
        };

        if self.issued.contains(&artifact.immutable) {
            return Err(DeployError::TagReused {
                service: service.to_string(),
                tag,
            });
        }

        // The immutable reference goes first so `latest` never names an unpublished build.
        for target in [&artifact.immutable, &artifact.latest] {
            self.registry
                .push(&image.local_image, target)
                .await
                .map_err(|e| DeployError::RegistryPushFailed {
                    image: target.to_string(),
                    reason: format!("{:#}", e),
                })?;
            if target == &artifact.immutable {
                self.issued.record(target)?;
            }
        }

        tracing::info!(
            service,
            immutable = %artifact.immutable,
            latest = %artifact.latest,
            "Build recorded"
        );

        self.artifacts
            .insert(service.to_string(), artifact.clone());

        Ok(artifact)
    }

    /// The image a deployment should use for `service`: this run's immutable
    /// build if there is one, otherwise the `latest` reference.
    pub fn deployable_image(&self, service: &str) -> Result<ImageRef> {
        if let Some(artifact) = self.artifacts.get(service) {
            return Ok(artifact.immutable.clone());
        }

        let image = self
            .images
            .get(service)
            .ok_or_else(|| DeployError::UnknownService(service.to_string()))?;
        Ok(ImageRef::new(
            self.config.repository(&image.repository),
            LATEST_TAG,
        ))
    }

    /// Placeholder → image reference for every service that declares a placeholder.
    pub fn image_tokens(&self) -> Result<BTreeMap<String, String>> {
        self.images
            .values()
            .filter_map(|image| image.placeholder.as_ref().map(|p| (p, &image.name)))
            .map(|(placeholder, service)| {
                Ok((placeholder.clone(), self.deployable_image(service)?.full_name()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRegistry;
    use tempdir::TempDir;

    fn images() -> Vec<ServiceImage> {
        vec![ServiceImage {
            name: "product-service".to_string(),
            repository: "product-service".to_string(),
            local_image: "product-service:ci".to_string(),
            placeholder: Some("_PRODUCT_SERVICE_IMAGE_".to_string()),
        }]
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            server: "acme.azurecr.io".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_distinct_immutable_tags_share_latest() {
        let registry = FakeRegistry::default();
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());

        let first = ledger
            .record_build("product-service", "abc123", RunId(42))
            .await
            .unwrap();
        let second = ledger
            .record_build("product-service", "abc123", RunId(43))
            .await
            .unwrap();

        assert_eq!(first.immutable.tag, "abc123-42");
        assert_eq!(second.immutable.tag, "abc123-43");
        assert_ne!(first.immutable, second.immutable);
        assert_eq!(first.latest, second.latest);
        assert_eq!(first.latest.full_name(), "acme.azurecr.io/product-service:latest");
    }

    #[tokio::test]
    async fn test_pushes_immutable_before_latest() {
        let registry = FakeRegistry::default();
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());
        ledger
            .record_build("product-service", "abc123", RunId(1))
            .await
            .unwrap();

        let pushed = registry.pushed();
        assert_eq!(
            pushed,
            vec![
                "acme.azurecr.io/product-service:abc123-1".to_string(),
                "acme.azurecr.io/product-service:latest".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_reused_tag_is_rejected() {
        let registry = FakeRegistry::default();
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());
        ledger
            .record_build("product-service", "abc123", RunId(42))
            .await
            .unwrap();

        let err = ledger
            .record_build("product-service", "abc123", RunId(42))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::TagReused { .. }));
        assert_eq!(registry.pushed().len(), 2);
    }

    #[tokio::test]
    async fn test_push_failure_is_fatal() {
        let registry = FakeRegistry::failing_on("latest");
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());

        let err = ledger
            .record_build("product-service", "abc123", RunId(42))
            .await
            .unwrap_err();
        let DeployError::RegistryPushFailed { image, .. } = err else {
            panic!("expected push failure");
        };
        assert_eq!(image, "acme.azurecr.io/product-service:latest");
        assert_eq!(
            ledger.deployable_image("product-service").unwrap().tag,
            LATEST_TAG,
            "a failed build is not deployable"
        );
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let registry = FakeRegistry::default();
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());
        let err = ledger
            .record_build("payments", "abc123", RunId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::UnknownService(s) if s == "payments"));
        assert!(registry.pushed().is_empty());
    }

    #[tokio::test]
    async fn test_issued_tags_survive_across_runs() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        let registry = FakeRegistry::default();

        let issued = IssuedTags::for_environment(temp_dir.path(), "production").unwrap();
        let mut first = ArtifactLedger::new(&registry, config(), images(), issued);
        first
            .record_build("product-service", "abc123", RunId(42))
            .await
            .unwrap();
        assert!(temp_dir.path().join("production.issued-tags.json").exists());

        let issued = IssuedTags::for_environment(temp_dir.path(), "production").unwrap();
        let mut rerun = ArtifactLedger::new(&registry, config(), images(), issued);
        let err = rerun
            .record_build("product-service", "abc123", RunId(42))
            .await
            .unwrap_err();

        assert!(matches!(err, DeployError::TagReused { ref tag, .. } if tag == "abc123-42"));
        assert_eq!(registry.pushed().len(), 2, "the rerun pushes nothing");
    }

    #[tokio::test]
    async fn test_tag_is_claimed_once_its_push_succeeds() {
        let registry = FakeRegistry::failing_on("latest");
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());
        ledger
            .record_build("product-service", "abc123", RunId(5))
            .await
            .unwrap_err();

        let issued = ledger.into_issued();
        assert!(issued.contains(&ImageRef::new("acme.azurecr.io/product-service", "abc123-5")));
        assert!(!issued.contains(&ImageRef::new("acme.azurecr.io/product-service", LATEST_TAG)));
    }

    #[test]
    fn test_invalid_revision_is_rejected() {
        assert!(immutable_tag("feature/x", RunId(1)).is_err());
        assert!(immutable_tag("", RunId(1)).is_err());
        assert!(immutable_tag(".abc", RunId(1)).is_err());
        assert_eq!(immutable_tag("v1.2", RunId(3)).unwrap(), "v1.2-3");
    }

    #[tokio::test]
    async fn test_image_tokens_fall_back_to_latest() {
        let registry = FakeRegistry::default();
        let mut ledger = ArtifactLedger::new(&registry, config(), images(), IssuedTags::in_memory());

        let tokens = ledger.image_tokens().unwrap();
        assert_eq!(
            tokens["_PRODUCT_SERVICE_IMAGE_"],
            "acme.azurecr.io/product-service:latest"
        );

        ledger
            .record_build("product-service", "abc123", RunId(9))
            .await
            .unwrap();
        let tokens = ledger.image_tokens().unwrap();
        assert_eq!(
            tokens["_PRODUCT_SERVICE_IMAGE_"],
            "acme.azurecr.io/product-service:abc123-9"
        );
    }
}
