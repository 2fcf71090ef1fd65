//! `kubectl`-backed cluster client, with optional Azure service-principal login.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempdir::TempDir;

use crate::{
    cluster::{ApplyOutcome, ClusterApi, ServiceStatus},
    process,
    resources::ResourceDefinition,
};

/// Default `kubectl` binary.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Default Azure CLI binary.
pub const DEFAULT_AZ: &str = "az";

/// JSONPath yielding the load balancer IP or hostname, whichever is set.
const EXTERNAL_ADDRESS_JSONPATH: &str =
    "jsonpath={.status.loadBalancer.ingress[0].ip}{.status.loadBalancer.ingress[0].hostname}";

/// Azure service-principal credentials for an AKS cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AzureLogin {
    pub tenant_id: String,
    pub client_id: String,
    /// Usually supplied through the environment rather than the config file.
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    pub resource_group: String,
    pub cluster_name: String,
    #[serde(default = "default_az")]
    pub az: String,
}

fn default_az() -> String {
    DEFAULT_AZ.to_string()
}

fn default_kubectl() -> String {
    DEFAULT_KUBECTL.to_string()
}

/// Configuration for the cluster client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Namespace every resource and service lives in.
    pub namespace: String,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// kubeconfig context to use. The current context when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Log in with Azure before talking to the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureLogin>,
}

impl ClusterConfig {
    /// Identity of the cluster and namespace resources land in, e.g.
    /// `rg-shop/aks-shop/shop`.
    pub fn target(&self) -> String {
        let cluster = match (&self.azure, &self.context) {
            (Some(azure), _) => format!("{}/{}", azure.resource_group, azure.cluster_name),
            (None, Some(context)) => context.clone(),
            (None, None) => "current-context".to_string(),
        };
        format!("{}/{}", cluster, self.namespace)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubectl: default_kubectl(),
            context: None,
            azure: None,
        }
    }
}

/// Cluster client shelling out to `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlCluster {
    config: ClusterConfig,
}

impl KubectlCluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["--namespace".to_string(), self.config.namespace.clone()];
        if let Some(context) = &self.config.context {
            args.extend(["--context".to_string(), context.clone()]);
        }
        args
    }
}

/// Write `secret` to a file only the current user can read.
fn write_secret(path: &Path, secret: &str) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(secret.as_bytes())
        .context("Failed to write the client secret")
}

/// Parse the outcome word from `kubectl apply` output such as
/// `deployment.apps/product-service configured`.
pub fn parse_apply_outcome(stdout: &str) -> Result<ApplyOutcome> {
    let word = stdout
        .lines()
        .rev()
        .find_map(|line| line.split_whitespace().last())
        .context("kubectl apply produced no output")?;

    match word {
        "created" => Ok(ApplyOutcome::Created),
        "configured" => Ok(ApplyOutcome::Configured),
        "unchanged" => Ok(ApplyOutcome::Unchanged),
        other => anyhow::bail!("Unexpected kubectl apply outcome `{}`", other),
    }
}

impl ClusterApi for KubectlCluster {
    async fn login(&self) -> Result<()> {
        let Some(azure) = &self.config.azure else {
            tracing::debug!("No Azure login configured, using the ambient kubeconfig");
            return Ok(());
        };

        let secret = azure
            .client_secret
            .as_ref()
            .context("Azure client secret is not set")?;

        tracing::info!(
            tenant = %azure.tenant_id,
            cluster = %azure.cluster_name,
            "Logging in to Azure"
        );

        // az expands `@path` arguments, so the secret never shows up in the process list.
        let secret_dir =
            TempDir::new("stagehand-az").context("Failed to create a directory for the client secret")?;
        let secret_file = secret_dir.path().join("client-secret");
        write_secret(&secret_file, secret)?;
        let password = format!("@{}", secret_file.display());

        let login_args = [
            "login",
            "--service-principal",
            "--username",
            azure.client_id.as_str(),
            "--password",
            password.as_str(),
            "--tenant",
            azure.tenant_id.as_str(),
            "--output",
            "none",
        ]
        .map(String::from);
        process::run_checked(&azure.az, &login_args, None, None)
            .await
            .context("Azure login rejected")?;
        drop(secret_dir);

        let credentials_args = [
            "aks",
            "get-credentials",
            "--resource-group",
            azure.resource_group.as_str(),
            "--name",
            azure.cluster_name.as_str(),
            "--overwrite-existing",
        ]
        .map(String::from);
        process::run_checked(&azure.az, &credentials_args, None, None)
            .await
            .context("Failed to fetch cluster credentials")?;

        Ok(())
    }

    fn logout(&self) -> Result<()> {
        let Some(azure) = &self.config.azure else {
            return Ok(());
        };

        let status = std::process::Command::new(&azure.az)
            .arg("logout")
            .status()
            .context("Failed to run az logout")?;
        if !status.success() {
            anyhow::bail!("az logout exited with {}", status);
        }

        tracing::info!("Logged out of Azure");
        Ok(())
    }

    async fn apply(&self, resource: &ResourceDefinition) -> Result<ApplyOutcome> {
        let mut args = self.base_args();
        args.extend(["apply", "-f", "-"].map(String::from));

        let stdout = process::run_checked(&self.config.kubectl, &args, Some(&resource.manifest), None)
            .await
            .with_context(|| format!("Failed to apply {}", resource.key()))?;

        parse_apply_outcome(&stdout)
    }

    async fn service_status(&self, service: &str) -> Result<ServiceStatus> {
        let mut args = self.base_args();
        args.extend(
            ["get", "service", service, "-o", EXTERNAL_ADDRESS_JSONPATH].map(String::from),
        );

        let stdout = process::run_checked(&self.config.kubectl, &args, None, None)
            .await
            .with_context(|| format!("Failed to query service {}", service))?;

        let address = stdout.trim();
        Ok(if address.is_empty() {
            ServiceStatus::pending()
        } else {
            ServiceStatus::ready(address)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply_outcome() {
        assert_eq!(
            parse_apply_outcome("deployment.apps/product-service configured\n").unwrap(),
            ApplyOutcome::Configured
        );
        assert_eq!(
            parse_apply_outcome("namespace/shop unchanged").unwrap(),
            ApplyOutcome::Unchanged
        );
        assert_eq!(
            parse_apply_outcome("service/order-service created\n\n").unwrap(),
            ApplyOutcome::Created
        );
        assert!(parse_apply_outcome("").is_err());
        assert!(parse_apply_outcome("deployment.apps/x exploded").is_err());
    }

    #[test]
    fn test_base_args_include_context() {
        let cluster = KubectlCluster::new(ClusterConfig {
            namespace: "shop".to_string(),
            context: Some("aks-prod".to_string()),
            ..Default::default()
        });
        assert_eq!(
            cluster.base_args(),
            vec!["--namespace", "shop", "--context", "aks-prod"]
        );
    }

    #[test]
    fn test_target_names_cluster_and_namespace() {
        let mut config = ClusterConfig {
            namespace: "shop".to_string(),
            ..Default::default()
        };
        assert_eq!(config.target(), "current-context/shop");

        config.context = Some("aks-prod".to_string());
        assert_eq!(config.target(), "aks-prod/shop");

        config.azure = Some(AzureLogin {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: None,
            resource_group: "rg-shop".to_string(),
            cluster_name: "aks-shop".to_string(),
            az: DEFAULT_AZ.to_string(),
        });
        assert_eq!(config.target(), "rg-shop/aks-shop/shop");
    }

    #[test]
    fn test_config_defaults_from_toml() {
        let config: ClusterConfig = toml::from_str("namespace = \"shop\"").unwrap();
        assert_eq!(config.kubectl, DEFAULT_KUBECTL);
        assert!(config.azure.is_none());
    }
}
