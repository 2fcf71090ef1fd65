//! The fixed stage graph and the work each stage performs.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::{
    artifact::ServiceImage,
    config::{DiscoveryTarget, PipelineConfig, ResourceSetConfig},
    discovery::PollPolicy,
    error::{DeployError, Result},
    inject::ConfigInjector,
    process,
    registry::RegistryConfig,
    resources::ResourceSet,
    run::{PipelineRun, TriggerCause},
    stage::{ExecutionMode, StageDefinition, StageId, StageStatus},
    trigger::{self, Gate, TriggerInput, UpstreamSignal},
};

pub const TEST_BACKEND: &str = "test-backend";
pub const BUILD_BACKEND: &str = "build-backend";
pub const BUILD_FRONTEND: &str = "build-frontend";
pub const PROVISION_INFRA: &str = "provision-infra";
pub const DEPLOY_BACKEND: &str = "deploy-backend";
pub const DISCOVER_ENDPOINTS: &str = "discover-endpoints";
pub const DEPLOY_FRONTEND: &str = "deploy-frontend";

/// Frontend deployment with its placeholder bindings.
#[derive(Debug, Clone)]
pub struct FrontendDeployment {
    pub artifact: PathBuf,
    pub config_map: String,
    pub config_key: String,
    /// Placeholder → parameter name.
    pub bindings: BTreeMap<String, String>,
    pub sets: Vec<ResourceSet>,
}

/// What a stage does once its gate opens.
#[derive(Debug, Clone)]
pub enum StageAction {
    /// Run an external test command.
    RunTests {
        program: String,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
    },
    /// Record and push builds of these services.
    RecordBuilds { services: Vec<String> },
    /// Apply resource sets in order.
    Provision { sets: Vec<ResourceSet> },
    /// Bind image placeholders, then apply resource sets in order.
    DeployServices { sets: Vec<ResourceSet> },
    /// Wait for external addresses and publish them as parameters.
    DiscoverEndpoints {
        targets: Vec<DiscoveryTarget>,
        policy: PollPolicy,
    },
    /// Rewrite the frontend artifact from stage inputs and deploy it.
    DeployFrontend(FrontendDeployment),
}

/// A stage definition with its action.
#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub definition: StageDefinition,
    pub action: StageAction,
}

/// Every stage of the pipeline, in execution order, plus the run-wide settings.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub stages: Vec<PipelineStage>,
    pub services: Vec<ServiceImage>,
    pub registry: RegistryConfig,
    pub namespace: String,
    pub injector: ConfigInjector,
}

fn load_sets(sets: &[ResourceSetConfig], base_dir: &Path) -> Result<Vec<ResourceSet>> {
    sets.iter()
        .map(|set| set.load(base_dir).map_err(DeployError::from))
        .collect()
}

impl PipelineDefinition {
    /// Build the standard test → build → provision → deploy → discover → frontend graph.
    ///
    /// Manifest and working-directory paths are resolved against `base_dir`.
    pub fn standard(config: &PipelineConfig, base_dir: &Path) -> Result<Self> {
        use TriggerCause::{PullRequest, Push};

        let branch = config.deploy_branch.as_str();
        let mut stages = Vec::new();

        if let Some(tests) = &config.tests {
            let (program, args) = process::split_command(&tests.command)
                .map_err(|e| DeployError::InvalidDefinition(format!("{:#}", e)))?;
            stages.push(PipelineStage {
                definition: StageDefinition::new(TEST_BACKEND)
                    .path_filter("backend/**")
                    .triggers([Push, PullRequest]),
                action: StageAction::RunTests {
                    program,
                    args,
                    working_dir: tests.working_dir.as_ref().map(|dir| base_dir.join(dir)),
                },
            });
        }

        let mut build_backend = StageDefinition::new(BUILD_BACKEND)
            .path_filter("backend/**")
            .triggers([Push])
            .branch(branch);
        if config.tests.is_some() {
            build_backend = build_backend.depends_on(TEST_BACKEND);
        }
        stages.push(PipelineStage {
            definition: build_backend,
            action: StageAction::RecordBuilds {
                services: config.build.backend.clone(),
            },
        });

        stages.push(PipelineStage {
            definition: StageDefinition::new(BUILD_FRONTEND)
                .path_filter("frontend/**")
                .triggers([Push])
                .branch(branch),
            action: StageAction::RecordBuilds {
                services: config.build.frontend.clone(),
            },
        });

        stages.push(PipelineStage {
            definition: StageDefinition::new(PROVISION_INFRA)
                .depends_on(BUILD_BACKEND)
                .triggers([Push])
                .branch(branch),
            action: StageAction::Provision {
                sets: load_sets(&config.infrastructure, base_dir)?,
            },
        });

        stages.push(PipelineStage {
            definition: StageDefinition::new(DEPLOY_BACKEND)
                .depends_on(PROVISION_INFRA)
                .triggers([Push])
                .branch(branch),
            action: StageAction::DeployServices {
                sets: load_sets(&config.backend, base_dir)?,
            },
        });

        stages.push(PipelineStage {
            definition: StageDefinition::new(DISCOVER_ENDPOINTS)
                .depends_on(DEPLOY_BACKEND)
                .triggers([Push])
                .branch(branch),
            action: StageAction::DiscoverEndpoints {
                targets: config.endpoints.clone(),
                policy: config.discovery,
            },
        });

        if let Some(frontend) = &config.frontend {
            let mut definition = StageDefinition::new(DEPLOY_FRONTEND)
                .depends_on(DISCOVER_ENDPOINTS)
                .triggers([Push])
                .mode(ExecutionMode::Callable);
            let inputs: BTreeSet<&String> = frontend.bindings.values().collect();
            for input in inputs {
                definition = definition.input(input.clone());
            }

            stages.push(PipelineStage {
                definition,
                action: StageAction::DeployFrontend(FrontendDeployment {
                    artifact: base_dir.join(&frontend.artifact),
                    config_map: frontend.config_map.clone(),
                    config_key: frontend.config_key.clone(),
                    bindings: frontend.bindings.clone(),
                    sets: load_sets(&frontend.sets, base_dir)?,
                }),
            });
        }

        let injector = match &config.placeholder_pattern {
            Some(pattern) => ConfigInjector::with_pattern(pattern)?,
            None => ConfigInjector::default(),
        };

        let pipeline = Self {
            stages,
            services: config.services.clone(),
            registry: config.registry.clone(),
            namespace: config.cluster.namespace.clone(),
            injector,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn stage(&self, id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.definition.id.as_str() == id)
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = &StageId> {
        self.stages.iter().map(|s| &s.definition.id)
    }

    /// Gate decisions for an automatic run, assuming every stage that runs
    /// succeeds. Nothing is executed.
    pub fn plan(&self, run: &PipelineRun) -> Vec<(&PipelineStage, Gate)> {
        let mut statuses = HashMap::new();
        self.stages
            .iter()
            .map(|stage| {
                let gate = trigger::resolve(
                    &stage.definition,
                    &TriggerInput {
                        cause: run.cause(),
                        branch: run.branch(),
                        changed_paths: run.changed_paths(),
                        upstream: UpstreamSignal::Statuses(&statuses),
                    },
                );
                let status = if gate.should_run() {
                    StageStatus::Succeeded
                } else {
                    StageStatus::Skipped
                };
                statuses.insert(stage.definition.id.clone(), status);
                (stage, gate)
            })
            .collect()
    }

    /// Check the graph is ordered, acyclic and refers only to known services.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&StageId> = HashSet::new();
        for stage in &self.stages {
            let id = &stage.definition.id;
            for dependency in &stage.definition.depends_on {
                if !seen.contains(dependency) {
                    return Err(DeployError::InvalidDefinition(format!(
                        "stage `{}` depends on `{}`, which is not an earlier stage",
                        id, dependency
                    )));
                }
            }
            if !seen.insert(id) {
                return Err(DeployError::InvalidDefinition(format!(
                    "duplicate stage `{}`",
                    id
                )));
            }

            match &stage.action {
                StageAction::RecordBuilds { services } => {
                    for service in services {
                        if !self.services.iter().any(|s| &s.name == service) {
                            return Err(DeployError::UnknownService(service.clone()));
                        }
                    }
                }
                StageAction::DiscoverEndpoints { targets, .. } => {
                    let mut parameters = HashSet::new();
                    for target in targets {
                        if !parameters.insert(&target.parameter) {
                            return Err(DeployError::InvalidDefinition(format!(
                                "parameter `{}` is published by more than one endpoint",
                                target.parameter
                            )));
                        }
                    }
                }
                StageAction::DeployFrontend(frontend) => {
                    if frontend.bindings.keys().any(|p| p.is_empty()) {
                        return Err(DeployError::InvalidDefinition(
                            "frontend binding with an empty placeholder".to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrontendConfig;

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::example("production");
        config.infrastructure.clear();
        config.backend.clear();
        if let Some(frontend) = config.frontend.as_mut() {
            frontend.sets.clear();
        }
        config
    }

    #[test]
    fn test_standard_graph_shape() {
        let pipeline = PipelineDefinition::standard(&config(), Path::new(".")).unwrap();

        let ids: Vec<&str> = pipeline.stage_ids().map(|id| id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                TEST_BACKEND,
                BUILD_BACKEND,
                BUILD_FRONTEND,
                PROVISION_INFRA,
                DEPLOY_BACKEND,
                DISCOVER_ENDPOINTS,
                DEPLOY_FRONTEND,
            ]
        );

        let frontend = &pipeline.stage(DEPLOY_FRONTEND).unwrap().definition;
        assert_eq!(frontend.mode, ExecutionMode::Callable);
        assert_eq!(frontend.inputs, vec!["ORDER_API_URL", "PRODUCT_API_URL"]);
        assert_eq!(frontend.depends_on, vec![StageId::from(DISCOVER_ENDPOINTS)]);

        let build = &pipeline.stage(BUILD_BACKEND).unwrap().definition;
        assert_eq!(build.depends_on, vec![StageId::from(TEST_BACKEND)]);
        assert_eq!(build.branches, vec!["main"]);
    }

    #[test]
    fn test_without_tests_build_is_ungated() {
        let mut config = config();
        config.tests = None;
        let pipeline = PipelineDefinition::standard(&config, Path::new(".")).unwrap();

        assert!(pipeline.stage(TEST_BACKEND).is_none());
        assert!(pipeline.stage(BUILD_BACKEND).unwrap().definition.depends_on.is_empty());
    }

    #[test]
    fn test_unknown_build_service() {
        let mut config = config();
        config.build.backend.push("payment-service".to_string());
        let err = PipelineDefinition::standard(&config, Path::new(".")).unwrap_err();
        assert!(matches!(err, DeployError::UnknownService(ref s) if s == "payment-service"));
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let mut config = config();
        let mut dup = config.endpoints[0].clone();
        dup.service = "other".to_string();
        config.endpoints.push(dup);
        let err = PipelineDefinition::standard(&config, Path::new(".")).unwrap_err();
        assert!(matches!(err, DeployError::InvalidDefinition(_)));
    }

    #[test]
    fn test_out_of_order_dependency_rejected() {
        let mut pipeline = PipelineDefinition::standard(&config(), Path::new(".")).unwrap();
        pipeline.stages.swap(3, 4);
        assert!(matches!(
            pipeline.validate(),
            Err(DeployError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_missing_manifest_fails() {
        let mut config = config();
        config.frontend = Some(FrontendConfig {
            sets: PipelineConfig::example("x").frontend.unwrap().sets,
            ..config.frontend.clone().unwrap()
        });
        assert!(PipelineDefinition::standard(&config, Path::new("/nonexistent")).is_err());
    }

    #[test]
    fn test_plan_frontend_push() {
        let pipeline = PipelineDefinition::standard(&config(), Path::new(".")).unwrap();
        let run = PipelineRun::new(1u64, TriggerCause::Push, "abc123", "main", ["frontend/x.js"]);

        let plan: Vec<(&str, bool)> = pipeline
            .plan(&run)
            .iter()
            .map(|(stage, gate)| (stage.definition.id.as_str(), gate.should_run()))
            .collect();
        assert_eq!(
            plan,
            vec![
                (TEST_BACKEND, false),
                (BUILD_BACKEND, false),
                (BUILD_FRONTEND, true),
                (PROVISION_INFRA, false),
                (DEPLOY_BACKEND, false),
                (DISCOVER_ENDPOINTS, false),
                (DEPLOY_FRONTEND, false),
            ]
        );
    }

    #[test]
    fn test_plan_backend_push_reaches_frontend() {
        let pipeline = PipelineDefinition::standard(&config(), Path::new(".")).unwrap();
        let run = PipelineRun::new(1u64, TriggerCause::Push, "abc123", "main", ["backend/a.py"]);

        let plan = pipeline.plan(&run);
        assert!(plan.iter().all(|(stage, gate)| {
            gate.should_run() || stage.definition.id.as_str() == BUILD_FRONTEND
        }));
    }
}
