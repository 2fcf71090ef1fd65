//! Container registry access.

use std::future::Future;

use anyhow::{Context, Result};
use bollard::{
    Docker,
    auth::DockerCredentials,
    image::{PushImageOptions, TagImageOptions},
};
use derive_more::Deref;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// A registry image reference with repository and tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// The full repository, including the registry host (e.g. "acme.azurecr.io/product-service").
    pub repository: String,
    /// The image tag (e.g. "latest" or "abc123-42").
    pub tag: String,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Get the full image reference (repository:tag).
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// The registry collaborator.
///
/// `push` publishes the locally built image `source` under `target`. It either
/// fully succeeds or returns an error; callers do not retry.
pub trait Registry: Send + Sync {
    fn push(&self, source: &str, target: &ImageRef) -> impl Future<Output = Result<()>> + Send;
}

/// Configuration for the container registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry host, e.g. "acme.azurecr.io". Empty for the daemon's default registry.
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl RegistryConfig {
    /// Qualify a repository name with the registry host.
    pub fn repository(&self, name: &str) -> String {
        if self.server.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.server.trim_end_matches('/'), name)
        }
    }
}

/// Registry client pushing through the local Docker daemon.
#[derive(Deref)]
pub struct DockerRegistry {
    #[deref]
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerRegistry {
    /// Connect to the local Docker daemon.
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker. Is Docker running?")?;

        let credentials = config.username.as_ref().map(|username| DockerCredentials {
            username: Some(username.clone()),
            password: config.password.clone(),
            serveraddress: Some(config.server.clone()),
            ..Default::default()
        });

        Ok(Self {
            docker,
            credentials,
        })
    }
}

impl Registry for DockerRegistry {
    async fn push(&self, source: &str, target: &ImageRef) -> Result<()> {
        tracing::debug!(source, target = %target, "Tagging image");

        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: target.repository.clone(),
                    tag: target.tag.clone(),
                }),
            )
            .await
            .with_context(|| format!("Failed to tag {} as {}", source, target))?;

        let mut stream = self.docker.push_image(
            &target.repository,
            Some(PushImageOptions {
                tag: target.tag.clone(),
            }),
            self.credentials.clone(),
        );

        while let Some(result) = stream.next().await {
            let info = result.with_context(|| format!("Failed to push {}", target))?;
            if let Some(error) = info.error {
                anyhow::bail!("Registry rejected {}: {}", target, error);
            }
            if let Some(status) = info.status {
                tracing::trace!(status, "Image push");
            }
        }

        tracing::info!(image = %target, "Image pushed");
        Ok(())
    }
}
