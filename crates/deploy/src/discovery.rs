//! Bounded polling for externally assigned service addresses.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use derive_more::Deref;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    cluster::ClusterApi,
    error::{DeployError, Result},
};

/// Default seconds between discovery attempts.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default number of discovery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PollPolicy {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Source of the wait between attempts.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A service together with its externally reachable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub service: String,
    pub address: String,
}

impl Endpoint {
    pub fn new(service: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            address: address.into(),
        }
    }

    /// `http://{address}[:{port}]`.
    pub fn url(&self, port: Option<u16>) -> anyhow::Result<Url> {
        let raw = match port {
            Some(port) => format!("http://{}:{}", self.address, port),
            None => format!("http://{}", self.address),
        };
        Url::parse(&raw).with_context(|| format!("Invalid endpoint address for {}", self.service))
    }
}

/// Every requested endpoint, keyed by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deref)]
pub struct Endpoints(BTreeMap<String, Endpoint>);

/// Polls the cluster until every requested service has an address.
pub struct EndpointPoller<'a, C, K> {
    cluster: &'a C,
    clock: &'a K,
    policy: PollPolicy,
}

impl<'a, C: ClusterApi, K: Clock> EndpointPoller<'a, C, K> {
    pub fn new(cluster: &'a C, clock: &'a K, policy: PollPolicy) -> Self {
        Self {
            cluster,
            clock,
            policy,
        }
    }

    /// Resolve all `services` or fail with the ones still missing.
    ///
    /// Within an attempt the outstanding services are queried concurrently.
    /// A service is never queried again once it resolved.
    pub async fn discover(&self, services: &BTreeSet<String>) -> Result<Endpoints> {
        let mut resolved = BTreeMap::new();
        if services.is_empty() {
            return Ok(Endpoints(resolved));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let pending: Vec<&String> = services
                .iter()
                .filter(|s| !resolved.contains_key(*s))
                .collect();

            let statuses = join_all(pending.iter().map(|s| self.cluster.service_status(s))).await;

            for (service, status) in pending.into_iter().zip(statuses) {
                match status {
                    Ok(status) => {
                        if let Some(address) = status.resolved_address() {
                            tracing::info!(service = %service, %address, attempt, "Endpoint resolved");
                            resolved.insert(service.clone(), Endpoint::new(service.as_str(), address));
                        }
                    }
                    Err(e) => {
                        tracing::debug!(service = %service, attempt, error = %e, "Status query failed, treating as pending");
                    }
                }
            }

            if resolved.len() == services.len() {
                return Ok(Endpoints(resolved));
            }

            tracing::debug!(
                attempt,
                max_attempts,
                outstanding = services.len() - resolved.len(),
                "Waiting for external addresses"
            );

            if attempt < max_attempts {
                self.clock.sleep(self.policy.interval()).await;
            }
        }

        let unresolved: BTreeSet<String> = services
            .iter()
            .filter(|s| !resolved.contains_key(*s))
            .cloned()
            .collect();
        tracing::error!(?unresolved, max_attempts, "Endpoint discovery timed out");

        Err(DeployError::DiscoveryTimeout {
            unresolved,
            attempts: max_attempts,
        })
    }
}
