//! Infrastructure resource definitions.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of a cluster resource.
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
pub enum ResourceKind {
    Namespace,
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    StatefulSet,
    Deployment,
    Service,
    Ingress,
}

/// A single manifest to hand to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub kind: ResourceKind,
    pub name: String,
    /// Manifest body (YAML or JSON) passed verbatim to the cluster.
    pub manifest: String,
}

impl ResourceDefinition {
    pub fn new(kind: ResourceKind, name: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            manifest: manifest.into(),
        }
    }

    /// Load a manifest body from a file.
    pub fn from_file(kind: ResourceKind, name: impl Into<String>, path: &Path) -> Result<Self> {
        let manifest = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        Ok(Self::new(kind, name, manifest))
    }

    /// Build a ConfigMap holding a single file.
    pub fn config_map(name: &str, namespace: &str, key: &str, content: &str) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(key.to_string(), content.into());

        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": namespace },
            "data": data,
        });
        Self::new(ResourceKind::ConfigMap, name, manifest.to_string())
    }

    /// `kind/name`, the form used in logs and errors.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// SHA-256 of kind, name and manifest body, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key().as_bytes());
        hasher.update([0]);
        hasher.update(self.manifest.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// An ordered group of resources applied together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceSet {
    pub name: String,
    pub resources: Vec<ResourceDefinition>,
}

impl ResourceSet {
    pub fn new(name: impl Into<String>, resources: Vec<ResourceDefinition>) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }

    /// Deterministic fingerprint over the resources, order included.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for resource in &self.resources {
            hasher.update(resource.fingerprint().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Apply `f` to every manifest body, keeping kinds and names.
    pub fn map_manifests<E>(
        &self,
        mut f: impl FnMut(&str) -> std::result::Result<String, E>,
    ) -> std::result::Result<Self, E> {
        let resources = self
            .resources
            .iter()
            .map(|r| {
                Ok(ResourceDefinition {
                    kind: r.kind,
                    name: r.name.clone(),
                    manifest: f(&r.manifest)?,
                })
            })
            .collect::<std::result::Result<_, E>>()?;
        Ok(Self::new(self.name.clone(), resources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn deployment(body: &str) -> ResourceDefinition {
        ResourceDefinition::new(ResourceKind::Deployment, "product-service", body)
    }

    #[test]
    fn test_fingerprint_determinism() {
        let set = ResourceSet::new("services", vec![deployment("replicas: 1")]);
        assert_eq!(set.fingerprint(), set.clone().fingerprint());
        assert_eq!(set.fingerprint().len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_fingerprint_changes_with_manifest() {
        let a = ResourceSet::new("services", vec![deployment("replicas: 1")]);
        let b = ResourceSet::new("services", vec![deployment("replicas: 2")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_changes_with_order() {
        let svc = ResourceDefinition::new(ResourceKind::Service, "product-service", "port: 8000");
        let a = ResourceSet::new("services", vec![deployment("x"), svc.clone()]);
        let b = ResourceSet::new("services", vec![svc, deployment("x")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_config_map_manifest() {
        let cm = ResourceDefinition::config_map("frontend-config", "shop", "main.js", "let a = 1;");
        let value: serde_json::Value = serde_json::from_str(&cm.manifest).unwrap();
        assert_eq!(value["kind"], "ConfigMap");
        assert_eq!(value["metadata"]["namespace"], "shop");
        assert_eq!(value["data"]["main.js"], "let a = 1;");
        assert_eq!(cm.key(), "config-map/frontend-config");
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join("ns.yaml");
        std::fs::write(&path, "kind: Namespace").unwrap();

        let resource = ResourceDefinition::from_file(ResourceKind::Namespace, "shop", &path).unwrap();
        assert_eq!(resource.manifest, "kind: Namespace");

        let missing = ResourceDefinition::from_file(
            ResourceKind::Namespace,
            "shop",
            &temp_dir.path().join("missing.yaml"),
        );
        assert!(missing.is_err());
    }
}
