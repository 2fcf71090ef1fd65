//! Scripted collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;

use crate::{
    cluster::{ApplyOutcome, ClusterApi, ServiceStatus},
    discovery::Clock,
    registry::{ImageRef, Registry},
    resources::ResourceDefinition,
};

/// Registry recording every pushed reference.
#[derive(Default)]
pub struct FakeRegistry {
    fail_on_tag: Option<String>,
    pushed: Mutex<Vec<String>>,
}

impl FakeRegistry {
    /// A registry that rejects pushes of the given tag.
    pub fn failing_on(tag: &str) -> Self {
        Self {
            fail_on_tag: Some(tag.to_string()),
            ..Default::default()
        }
    }

    pub fn pushed(&self) -> Vec<String> {
        self.pushed.lock().unwrap().clone()
    }
}

impl Registry for FakeRegistry {
    async fn push(&self, _source: &str, target: &ImageRef) -> Result<()> {
        if self.fail_on_tag.as_deref() == Some(target.tag.as_str()) {
            anyhow::bail!("denied: requested access to the resource is denied");
        }
        self.pushed.lock().unwrap().push(target.full_name());
        Ok(())
    }
}

/// Cluster with scripted service addresses and an apply log.
#[derive(Default)]
pub struct FakeCluster {
    reject_login: bool,
    failing: HashSet<String>,
    /// service -> (address, number of queries before it resolves)
    addresses: HashMap<String, (String, u32)>,
    erroring: HashSet<String>,
    state: Mutex<FakeClusterState>,
}

#[derive(Default)]
struct FakeClusterState {
    applied: HashMap<String, String>,
    log: Vec<String>,
    queries: HashMap<String, u32>,
    logins: u32,
    logouts: u32,
}

impl FakeCluster {
    pub fn reject_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    /// Fail applies of the resource with this name.
    pub fn fail_apply(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// `service` reports `address` from its `on_query`-th status query onwards.
    pub fn resolve(mut self, service: &str, address: &str, on_query: u32) -> Self {
        self.addresses
            .insert(service.to_string(), (address.to_string(), on_query));
        self
    }

    /// Status queries for `service` return an error.
    pub fn error_on(mut self, service: &str) -> Self {
        self.erroring.insert(service.to_string());
        self
    }

    /// Resource keys in the order they reached the cluster.
    pub fn apply_log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn queries(&self, service: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .queries
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    pub fn logins(&self) -> u32 {
        self.state.lock().unwrap().logins
    }

    pub fn logouts(&self) -> u32 {
        self.state.lock().unwrap().logouts
    }
}

impl ClusterApi for FakeCluster {
    async fn login(&self) -> Result<()> {
        if self.reject_login {
            anyhow::bail!("AADSTS7000215: Invalid client secret provided");
        }
        self.state.lock().unwrap().logins += 1;
        Ok(())
    }

    fn logout(&self) -> Result<()> {
        self.state.lock().unwrap().logouts += 1;
        Ok(())
    }

    async fn apply(&self, resource: &ResourceDefinition) -> Result<ApplyOutcome> {
        if self.failing.contains(&resource.name) {
            anyhow::bail!("admission webhook denied {}", resource.key());
        }

        let mut state = self.state.lock().unwrap();
        state.log.push(resource.key());
        let previous = state
            .applied
            .insert(resource.key(), resource.manifest.clone());
        Ok(match previous {
            None => ApplyOutcome::Created,
            Some(body) if body == resource.manifest => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Configured,
        })
    }

    async fn service_status(&self, service: &str) -> Result<ServiceStatus> {
        let count = {
            let mut state = self.state.lock().unwrap();
            let count = state.queries.entry(service.to_string()).or_default();
            *count += 1;
            *count
        };

        if self.erroring.contains(service) {
            anyhow::bail!("services \"{}\" not found", service);
        }

        Ok(match self.addresses.get(service) {
            Some((address, on_query)) if count >= *on_query => ServiceStatus::ready(address),
            _ => ServiceStatus::pending(),
        })
    }
}

/// Clock that records requested sleeps and returns immediately.
#[derive(Default)]
pub struct FakeClock {
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for FakeClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}
