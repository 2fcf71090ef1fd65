//! Ordered, idempotent application of resource sets.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    cluster::{ApplyOutcome, ClusterApi},
    error::{DeployError, Result},
    resources::ResourceSet,
    state,
};

/// Record name of the applied-set ledger, stored as `{environment}.applied-sets.json`.
const APPLIED_LEDGER: &str = "applied-sets";

/// Fingerprint of a set that was applied successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSet {
    pub fingerprint: String,
    /// Unix timestamp of the apply.
    pub applied_at: i64,
}

/// Record of which set versions are live on one cluster target, keyed by set name.
///
/// Each environment has its own file in the state directory. The ledger
/// remembers the cluster target it describes and starts over when the
/// environment is pointed at a different one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedLedger {
    #[serde(default)]
    target: String,
    sets: BTreeMap<String, AppliedSet>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl AppliedLedger {
    /// An in-memory ledger that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the ledger of `environment` for the cluster `target`, e.g.
    /// [`ClusterConfig::target`](crate::ClusterConfig::target).
    pub fn for_environment(state_dir: &Path, environment: &str, target: &str) -> anyhow::Result<Self> {
        let path = state::environment_file(state_dir, environment, APPLIED_LEDGER);
        let mut ledger: Self = state::load_or_default(&path)?;

        if ledger.target != target {
            if !ledger.sets.is_empty() {
                tracing::warn!(
                    environment,
                    previous = %ledger.target,
                    target,
                    "Cluster target changed, applied sets are forgotten"
                );
            }
            ledger.sets.clear();
            ledger.target = target.to_string();
        }

        ledger.path = Some(path);
        Ok(ledger)
    }

    pub fn is_current(&self, set: &ResourceSet) -> bool {
        self.get(&set.name)
            .is_some_and(|applied| applied.fingerprint == set.fingerprint())
    }

    pub fn get(&self, set_name: &str) -> Option<&AppliedSet> {
        self.sets.get(set_name)
    }

    fn record(&mut self, set: &ResourceSet) -> anyhow::Result<()> {
        self.sets.insert(
            set.name.clone(),
            AppliedSet {
                fingerprint: set.fingerprint(),
                applied_at: chrono::Utc::now().timestamp(),
            },
        );
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        match &self.path {
            Some(path) => state::save(path, self),
            None => Ok(()),
        }
    }
}

/// What happened to one set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// Every resource went to the cluster; outcomes in declared order.
    Applied(Vec<(String, ApplyOutcome)>),
    /// The fingerprint matched the ledger; nothing was sent.
    Unchanged,
}

/// Per-set outcomes of one [`ProvisioningSequencer::apply`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub sets: Vec<(String, SetOutcome)>,
}

impl ProvisionReport {
    pub fn outcome(&self, set_name: &str) -> Option<&SetOutcome> {
        self.sets
            .iter()
            .find(|(name, _)| name == set_name)
            .map(|(_, outcome)| outcome)
    }
}

/// One line per set, e.g. `base: namespace/shop created, secret/db configured`.
impl fmt::Display for ProvisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, outcome)) in self.sets.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match outcome {
                SetOutcome::Unchanged => write!(f, "{}: unchanged", name)?,
                SetOutcome::Applied(resources) => {
                    let resources = resources
                        .iter()
                        .map(|(key, outcome)| format!("{} {}", key, outcome))
                        .collect::<Vec<_>>()
                        .join(", ");
                    write!(f, "{}: {}", name, resources)?;
                }
            }
        }
        Ok(())
    }
}

/// Applies resource sets one after the other.
#[derive(Debug)]
pub struct ProvisioningSequencer {
    ledger: AppliedLedger,
    force: bool,
}

impl ProvisioningSequencer {
    pub fn new(ledger: AppliedLedger) -> Self {
        Self {
            ledger,
            force: false,
        }
    }

    /// Re-apply sets even when the ledger says they are current.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Apply `sets` in order.
    ///
    /// Set *i+1* is only started once every resource of set *i* has been
    /// accepted by the cluster. The first failure stops the sequence.
    pub async fn apply<C: ClusterApi>(
        &mut self,
        cluster: &C,
        sets: &[ResourceSet],
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();

        for set in sets {
            if !self.force && self.ledger.is_current(set) {
                let applied_at = self.ledger.get(&set.name).map(|applied| applied.applied_at);
                tracing::info!(set = %set.name, ?applied_at, "Resource set unchanged, skipping");
                report.sets.push((set.name.clone(), SetOutcome::Unchanged));
                continue;
            }

            tracing::info!(set = %set.name, resources = set.resources.len(), "Applying resource set");

            let mut outcomes = Vec::with_capacity(set.resources.len());
            for resource in &set.resources {
                let outcome =
                    cluster
                        .apply(resource)
                        .await
                        .map_err(|e| DeployError::ProvisioningFailed {
                            failed_set: set.name.clone(),
                            resource: resource.key(),
                            reason: format!("{:#}", e),
                        })?;
                tracing::debug!(resource = %resource.key(), %outcome, "Resource applied");
                outcomes.push((resource.key(), outcome));
            }

            self.ledger.record(set)?;
            report.sets.push((set.name.clone(), SetOutcome::Applied(outcomes)));
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceDefinition, ResourceKind};
    use crate::testing::FakeCluster;
    use tempdir::TempDir;

    fn sets() -> Vec<ResourceSet> {
        vec![
            ResourceSet::new(
                "base",
                vec![
                    ResourceDefinition::new(ResourceKind::Namespace, "shop", "kind: Namespace"),
                    ResourceDefinition::new(ResourceKind::Secret, "db-credentials", "kind: Secret"),
                ],
            ),
            ResourceSet::new(
                "database",
                vec![ResourceDefinition::new(ResourceKind::StatefulSet, "postgres", "replicas: 1")],
            ),
            ResourceSet::new(
                "services",
                vec![ResourceDefinition::new(
                    ResourceKind::Deployment,
                    "product-service",
                    "replicas: 2",
                )],
            ),
        ]
    }

    #[tokio::test]
    async fn test_sets_applied_in_order() {
        let cluster = FakeCluster::default();
        let mut sequencer = ProvisioningSequencer::new(AppliedLedger::in_memory());

        let report = sequencer.apply(&cluster, &sets()).await.unwrap();

        assert_eq!(
            cluster.apply_log(),
            vec![
                "namespace/shop",
                "secret/db-credentials",
                "stateful-set/postgres",
                "deployment/product-service",
            ]
        );
        assert_eq!(report.sets.len(), 3);
        assert!(matches!(report.outcome("database"), Some(SetOutcome::Applied(_))));
    }

    #[tokio::test]
    async fn test_failure_stops_later_sets() {
        let cluster = FakeCluster::default().fail_apply("postgres");
        let mut sequencer = ProvisioningSequencer::new(AppliedLedger::in_memory());

        let err = sequencer.apply(&cluster, &sets()).await.unwrap_err();

        match err {
            DeployError::ProvisioningFailed {
                failed_set,
                resource,
                ..
            } => {
                assert_eq!(failed_set, "database");
                assert_eq!(resource, "stateful-set/postgres");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(
            !cluster
                .apply_log()
                .contains(&"deployment/product-service".to_string()),
            "services must not be applied after the database failed"
        );
        assert!(sequencer.ledger.get("database").is_none());
        assert!(sequencer.ledger.get("base").is_some());
    }

    #[tokio::test]
    async fn test_reapply_unchanged_is_noop() {
        let cluster = FakeCluster::default();
        let mut sequencer = ProvisioningSequencer::new(AppliedLedger::in_memory());
        sequencer.apply(&cluster, &sets()).await.unwrap();
        let calls = cluster.apply_log().len();

        let report = sequencer.apply(&cluster, &sets()).await.unwrap();

        assert_eq!(cluster.apply_log().len(), calls);
        assert!(
            report
                .sets
                .iter()
                .all(|(_, outcome)| *outcome == SetOutcome::Unchanged)
        );
    }

    #[tokio::test]
    async fn test_changed_set_is_reapplied() {
        let cluster = FakeCluster::default();
        let mut sequencer = ProvisioningSequencer::new(AppliedLedger::in_memory());
        sequencer.apply(&cluster, &sets()).await.unwrap();

        let mut changed = sets();
        changed[2].resources[0].manifest = "replicas: 3".to_string();
        let report = sequencer.apply(&cluster, &changed).await.unwrap();

        assert_eq!(report.outcome("base"), Some(&SetOutcome::Unchanged));
        assert_eq!(
            report.outcome("services"),
            Some(&SetOutcome::Applied(vec![(
                "deployment/product-service".to_string(),
                ApplyOutcome::Configured
            )]))
        );
    }

    #[tokio::test]
    async fn test_force_bypasses_ledger() {
        let cluster = FakeCluster::default();
        let mut sequencer = ProvisioningSequencer::new(AppliedLedger::in_memory()).with_force(true);
        sequencer.apply(&cluster, &sets()).await.unwrap();

        let report = sequencer.apply(&cluster, &sets()).await.unwrap();

        assert_eq!(cluster.apply_log().len(), 8);
        assert_eq!(
            report.outcome("database"),
            Some(&SetOutcome::Applied(vec![(
                "stateful-set/postgres".to_string(),
                ApplyOutcome::Unchanged
            )]))
        );
    }

    #[tokio::test]
    async fn test_ledger_persists_across_loads() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        let cluster = FakeCluster::default();

        let ledger = AppliedLedger::for_environment(temp_dir.path(), "staging", "aks-staging/shop").unwrap();
        let mut first = ProvisioningSequencer::new(ledger);
        first.apply(&cluster, &sets()).await.unwrap();
        assert!(temp_dir.path().join("staging.applied-sets.json").exists());

        let ledger = AppliedLedger::for_environment(temp_dir.path(), "staging", "aks-staging/shop").unwrap();
        for set in sets() {
            assert!(ledger.is_current(&set), "{} should be current", set.name);
        }
    }

    #[tokio::test]
    async fn test_environments_do_not_share_applied_sets() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        let target = "current-context/shop";

        let staging = FakeCluster::default();
        let ledger = AppliedLedger::for_environment(temp_dir.path(), "staging", target).unwrap();
        ProvisioningSequencer::new(ledger)
            .apply(&staging, &sets()[..1])
            .await
            .unwrap();

        let production = FakeCluster::default();
        let ledger = AppliedLedger::for_environment(temp_dir.path(), "production", target).unwrap();
        let report = ProvisioningSequencer::new(ledger)
            .apply(&production, &sets()[..1])
            .await
            .unwrap();

        assert!(matches!(report.outcome("base"), Some(SetOutcome::Applied(_))));
        assert_eq!(production.apply_log(), vec!["namespace/shop", "secret/db-credentials"]);
    }

    #[tokio::test]
    async fn test_new_cluster_target_forgets_applied_sets() {
        let temp_dir = TempDir::new("stagehand-test").expect("Failed to create temp dir");
        let cluster = FakeCluster::default();

        let ledger = AppliedLedger::for_environment(temp_dir.path(), "production", "aks-old/shop").unwrap();
        ProvisioningSequencer::new(ledger)
            .apply(&cluster, &sets())
            .await
            .unwrap();

        let ledger = AppliedLedger::for_environment(temp_dir.path(), "production", "aks-new/shop").unwrap();
        assert!(sets().iter().all(|set| !ledger.is_current(set)));
        assert!(ledger.get("base").is_none());
    }

    #[test]
    fn test_report_lists_resource_outcomes() {
        let report = ProvisionReport {
            sets: vec![
                ("base".to_string(), SetOutcome::Unchanged),
                (
                    "services".to_string(),
                    SetOutcome::Applied(vec![
                        ("deployment/product-service".to_string(), ApplyOutcome::Created),
                        ("service/product-service-w10".to_string(), ApplyOutcome::Configured),
                    ]),
                ),
            ],
        };

        assert_eq!(
            report.to_string(),
            "base: unchanged\nservices: deployment/product-service created, service/product-service-w10 configured"
        );
    }
}
