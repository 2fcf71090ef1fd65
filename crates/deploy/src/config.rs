use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::{
    ClusterConfig, HealthCheck, PollPolicy, RegistryConfig, ResourceDefinition, ResourceKind,
    ResourceSet, ServiceImage,
};

/// The default name for the stagehand configuration file.
pub const CONFIG_FILENAME: &str = "Stagehand.toml";

/// Default directory for locks and the applied-set ledger.
pub const DEFAULT_STATE_DIR: &str = ".stagehand";

/// Default branch that deploys.
pub const DEFAULT_DEPLOY_BRANCH: &str = "main";

/// A manifest file belonging to a resource set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRef {
    pub kind: ResourceKind,
    pub name: String,
    /// Path relative to the configuration file.
    pub path: PathBuf,
}

/// Ordered manifests applied as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSetConfig {
    pub name: String,
    #[serde(default)]
    pub manifests: Vec<ManifestRef>,
}

impl ResourceSetConfig {
    /// Read every manifest, resolving paths against `base_dir`.
    pub fn load(&self, base_dir: &Path) -> Result<ResourceSet> {
        let resources = self
            .manifests
            .iter()
            .map(|m| ResourceDefinition::from_file(m.kind, m.name.clone(), &base_dir.join(&m.path)))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Failed to load resource set `{}`", self.name))?;
        Ok(ResourceSet::new(self.name.clone(), resources))
    }
}

/// Backend test command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Shell-style command line, e.g. `pytest -q`.
    pub command: String,
    /// Working directory relative to the configuration file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// Which configured services each build stage publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub backend: Vec<String>,
    #[serde(default)]
    pub frontend: Vec<String>,
}

/// A service whose external address is published as a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTarget {
    /// Cluster service name.
    pub service: String,
    /// Port appended to the published URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Parameter name the URL is published under.
    pub parameter: String,
    /// Health path checked before publishing. No check when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheck>,
}

/// Frontend deployment: the prebuilt artifact and how it is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Prebuilt file holding the endpoint placeholders.
    pub artifact: PathBuf,
    /// ConfigMap the rewritten artifact is stored in.
    pub config_map: String,
    /// Key of the artifact inside the ConfigMap.
    pub config_key: String,
    /// Placeholder → parameter name.
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    #[serde(default)]
    pub sets: Vec<ResourceSetConfig>,
}

/// Complete configuration of a pipeline for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Environment name; also names the run lock.
    pub environment: String,
    /// Directory for locks and the applied-set ledger.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Branch whose pushes deploy.
    #[serde(default = "default_deploy_branch")]
    pub deploy_branch: String,
    /// Regex recognising leftover placeholders after injection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder_pattern: Option<String>,

    pub cluster: ClusterConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub discovery: PollPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestConfig>,
    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub services: Vec<ServiceImage>,
    /// Sets applied by the provisioning stage, in order.
    #[serde(default)]
    pub infrastructure: Vec<ResourceSetConfig>,
    /// Sets applied by the backend deployment stage, in order.
    #[serde(default)]
    pub backend: Vec<ResourceSetConfig>,
    #[serde(default)]
    pub endpoints: Vec<DiscoveryTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frontend: Option<FrontendConfig>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_DIR)
}

fn default_deploy_branch() -> String {
    DEFAULT_DEPLOY_BRANCH.to_string()
}

fn set(name: &str, manifests: &[(ResourceKind, &str, &str)]) -> ResourceSetConfig {
    ResourceSetConfig {
        name: name.to_string(),
        manifests: manifests
            .iter()
            .map(|(kind, name, path)| ManifestRef {
                kind: *kind,
                name: name.to_string(),
                path: PathBuf::from(path),
            })
            .collect(),
    }
}

fn service(name: &str, placeholder: Option<&str>) -> ServiceImage {
    ServiceImage {
        name: name.to_string(),
        repository: name.to_string(),
        local_image: format!("{}:ci", name),
        placeholder: placeholder.map(String::from),
    }
}

impl PipelineConfig {
    /// Starter configuration for the product/order/frontend layout.
    pub fn example(environment: impl Into<String>) -> Self {
        use ResourceKind::*;

        Self {
            environment: environment.into(),
            state_dir: default_state_dir(),
            deploy_branch: default_deploy_branch(),
            placeholder_pattern: None,
            cluster: ClusterConfig::default(),
            registry: RegistryConfig::default(),
            discovery: PollPolicy::default(),
            tests: Some(TestConfig {
                command: "pytest -q".to_string(),
                working_dir: Some(PathBuf::from("backend")),
            }),
            build: BuildConfig {
                backend: vec!["product-service".to_string(), "order-service".to_string()],
                frontend: vec!["frontend".to_string()],
            },
            services: vec![
                service("product-service", Some("_PRODUCT_SERVICE_IMAGE_")),
                service("order-service", Some("_ORDER_SERVICE_IMAGE_")),
                service("frontend", Some("_FRONTEND_IMAGE_")),
            ],
            infrastructure: vec![
                set(
                    "base",
                    &[
                        (Namespace, "shop", "k8s/namespace.yaml"),
                        (ConfigMap, "ecomm-config", "k8s/configmaps.yaml"),
                        (Secret, "ecomm-secrets", "k8s/secrets.yaml"),
                    ],
                ),
                set(
                    "database",
                    &[
                        (StatefulSet, "postgres", "k8s/postgres-statefulset.yaml"),
                        (Service, "postgres", "k8s/postgres-service.yaml"),
                    ],
                ),
            ],
            backend: vec![set(
                "services",
                &[
                    (Deployment, "product-service", "k8s/product-service-deployment.yaml"),
                    (Service, "product-service-w10", "k8s/product-service-service.yaml"),
                    (Deployment, "order-service", "k8s/order-service-deployment.yaml"),
                    (Service, "order-service-w10", "k8s/order-service-service.yaml"),
                ],
            )],
            endpoints: vec![
                DiscoveryTarget {
                    service: "product-service-w10".to_string(),
                    port: Some(8000),
                    parameter: "PRODUCT_API_URL".to_string(),
                    health: Some(HealthCheck::default()),
                },
                DiscoveryTarget {
                    service: "order-service-w10".to_string(),
                    port: Some(8001),
                    parameter: "ORDER_API_URL".to_string(),
                    health: Some(HealthCheck::default()),
                },
            ],
            frontend: Some(FrontendConfig {
                artifact: PathBuf::from("frontend/main.js"),
                config_map: "frontend-config".to_string(),
                config_key: "main.js".to_string(),
                bindings: BTreeMap::from([
                    ("_PRODUCT_API_URL_".to_string(), "PRODUCT_API_URL".to_string()),
                    ("_ORDER_API_URL_".to_string(), "ORDER_API_URL".to_string()),
                ]),
                sets: vec![set(
                    "frontend",
                    &[
                        (Deployment, "frontend", "k8s/frontend-deployment.yaml"),
                        (Service, "frontend-w10", "k8s/frontend-service.yaml"),
                    ],
                )],
            }),
        }
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize pipeline config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_save_load_roundtrip() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        let config = PipelineConfig::example("production");

        let path = temp_dir.path().join(CONFIG_FILENAME);
        config.save_to_file(&path).unwrap();
        let loaded: PipelineConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            environment = "staging"

            [cluster]
            namespace = "shop"
            "#,
        )
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.deploy_branch, "main");
        assert_eq!(config.discovery, PollPolicy::default());
        assert!(config.frontend.is_none());
    }

    #[test]
    fn test_resource_set_load() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        std::fs::create_dir(temp_dir.path().join("k8s")).unwrap();
        std::fs::write(temp_dir.path().join("k8s/ns.yaml"), "kind: Namespace").unwrap();

        let loaded = set("base", &[(ResourceKind::Namespace, "shop", "k8s/ns.yaml")])
            .load(temp_dir.path())
            .unwrap();
        assert_eq!(loaded.resources[0].manifest, "kind: Namespace");

        let missing = set("base", &[(ResourceKind::Secret, "s", "k8s/missing.yaml")]);
        assert!(missing.load(temp_dir.path()).is_err());
    }
}
