//! HTTP readiness probing for discovered endpoints.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    discovery::{Clock, PollPolicy},
    error::{DeployError, Result},
};

/// Timeout of a single health request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_policy() -> PollPolicy {
    PollPolicy {
        interval_secs: 2,
        max_attempts: 30,
    }
}

/// Health endpoint polled once a service has an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_policy")]
    pub policy: PollPolicy,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: default_health_path(),
            policy: default_health_policy(),
        }
    }
}

/// Create an HTTP client for health checks.
pub fn create_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .context("Failed to create HTTP client")
}

async fn check_once(client: &reqwest::Client, url: &Url) -> anyhow::Result<()> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("{} answered {}", url, status);
    }
    Ok(())
}

/// Poll `base` + `check.path` until it answers with a success status.
pub async fn wait_until_healthy<K: Clock>(
    client: &reqwest::Client,
    clock: &K,
    service: &str,
    base: &Url,
    check: &HealthCheck,
) -> Result<()> {
    let url = base
        .join(&check.path)
        .with_context(|| format!("Invalid health path `{}`", check.path))?;

    let max_attempts = check.policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match check_once(client, &url).await {
            Ok(()) => {
                tracing::info!(service, %url, attempt, "Endpoint healthy");
                return Ok(());
            }
            Err(e) => {
                tracing::trace!(service, error = %e, attempt, "Health check failed, retrying...");
                last_error = Some(e);
            }
        }

        if attempt < max_attempts {
            clock.sleep(check.policy.interval()).await;
        }
    }

    Err(DeployError::EndpointUnhealthy {
        service: service.to_string(),
        reason: last_error
            .map(|e| format!("{:#}", e))
            .unwrap_or_else(|| "no request was made".to_string()),
    })
}
