//! Cluster control API seam and authenticated session scope.

use std::future::Future;
use std::ops::Deref;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::DeployError;
use crate::resources::ResourceDefinition;

/// What the cluster reported after applying a resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ApplyOutcome {
    Created,
    Configured,
    Unchanged,
}

/// Externally visible state of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    /// The load balancer address, once one is assigned.
    pub external_address: Option<String>,
}

impl ServiceStatus {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn ready(address: impl Into<String>) -> Self {
        Self {
            external_address: Some(address.into()),
        }
    }

    /// The address, if it is assigned and not blank.
    pub fn resolved_address(&self) -> Option<&str> {
        self.external_address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
    }
}

/// The cluster control API collaborator.
///
/// Every `apply` is atomic from the caller's point of view: it either succeeds
/// or fails as a whole.
pub trait ClusterApi: Send + Sync {
    /// Authenticate against the control plane.
    fn login(&self) -> impl Future<Output = Result<()>> + Send;

    /// Drop the authenticated session. Synchronous so it can run from `Drop`.
    fn logout(&self) -> Result<()>;

    /// Apply one resource definition.
    fn apply(
        &self,
        resource: &ResourceDefinition,
    ) -> impl Future<Output = Result<ApplyOutcome>> + Send;

    /// Query a service's current external address.
    fn service_status(&self, service: &str) -> impl Future<Output = Result<ServiceStatus>> + Send;
}

/// An authenticated cluster session.
///
/// The session is logged out by [`ClusterSession::close`] or, if that never
/// happens, when the session is dropped.
#[derive(Debug)]
pub struct ClusterSession<'c, C: ClusterApi> {
    cluster: &'c C,
    open: bool,
}

impl<'c, C: ClusterApi> ClusterSession<'c, C> {
    /// Log in and return the session guard.
    ///
    /// A rejected login is followed by a logout, since it may have failed
    /// after some of its steps succeeded.
    pub async fn open(cluster: &'c C) -> Result<Self, DeployError> {
        if let Err(e) = cluster.login().await {
            if let Err(logout) = cluster.logout() {
                tracing::warn!(error = %logout, "Failed to log out after a rejected login");
            }
            return Err(DeployError::AuthenticationFailed(format!("{:#}", e)));
        }
        tracing::debug!("Cluster session opened");
        Ok(Self {
            cluster,
            open: true,
        })
    }

    /// Log out now and report the outcome.
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        let result = self.cluster.logout();
        tracing::debug!(ok = result.is_ok(), "Cluster session closed");
        result
    }
}

impl<C: ClusterApi> Deref for ClusterSession<'_, C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.cluster
    }
}

impl<C: ClusterApi> Drop for ClusterSession<'_, C> {
    fn drop(&mut self) {
        if !self.open {
            return;
        }

        tracing::debug!("Cluster session dropped while open, logging out");
        if let Err(e) = self.cluster.logout() {
            tracing::error!(error = ?e, "Failed to log out of the cluster");
        }
    }
}
