//! Drives one pipeline run through the stage graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Context;

use crate::{
    artifact::{ArtifactLedger, IssuedTags},
    cluster::{ClusterApi, ClusterSession},
    config::DiscoveryTarget,
    discovery::{Clock, EndpointPoller, PollPolicy},
    error::{DeployError, Result},
    health,
    params::{ParameterPropagator, ParameterSet, ParameterSource},
    pipeline::{FrontendDeployment, PipelineDefinition, PipelineStage, StageAction},
    process,
    provision::{AppliedLedger, ProvisionReport, ProvisioningSequencer},
    registry::Registry,
    resources::{ResourceDefinition, ResourceSet},
    run::{PipelineRun, RunId, TriggerCause},
    stage::{StageId, StageStatus},
    trigger::{self, Gate, SkipReason, TriggerInput, UpstreamSignal},
};

/// How the run was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// Evaluate the whole graph; parameters flow between stages.
    Automatic,
    /// Run a single stage with caller-supplied parameters.
    ///
    /// The run's cause must be `manual` or `chained`.
    Direct {
        stage: StageId,
        parameters: ParameterSet,
    },
}

/// How a stage ended.
#[derive(Debug)]
pub enum StageOutcome {
    Succeeded,
    Skipped(SkipReason),
    Failed(DeployError),
}

impl StageOutcome {
    pub fn status(&self) -> StageStatus {
        match self {
            Self::Succeeded => StageStatus::Succeeded,
            Self::Skipped(_) => StageStatus::Skipped,
            Self::Failed(_) => StageStatus::Failed,
        }
    }
}

/// Terminal record of one stage.
#[derive(Debug)]
pub struct StageReport {
    pub stage: StageId,
    pub outcome: StageOutcome,
    /// Per-set and per-resource outcomes of a stage that applied resources.
    pub provisioned: Option<ProvisionReport>,
}

/// Everything a run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    /// Stages in the order they were evaluated.
    pub stages: Vec<StageReport>,
    /// Parameters published during the run.
    pub outputs: ParameterSet,
}

impl RunReport {
    pub fn status(&self, stage: &str) -> Option<StageStatus> {
        self.stages
            .iter()
            .find(|r| r.stage.as_str() == stage)
            .map(|r| r.outcome.status())
    }

    pub fn is_success(&self) -> bool {
        self.first_failure().is_none()
    }

    /// The first stage that failed, which is the run's terminal error.
    pub fn first_failure(&self) -> Option<(&StageId, &DeployError)> {
        self.stages.iter().find_map(|r| match &r.outcome {
            StageOutcome::Failed(e) => Some((&r.stage, e)),
            _ => None,
        })
    }

    /// The published outputs, or the first failure.
    pub fn into_result(self) -> Result<ParameterSet> {
        for report in self.stages {
            if let StageOutcome::Failed(e) = report.outcome {
                return Err(e);
            }
        }
        Ok(self.outputs)
    }
}

/// State owned by a single run.
struct RunState<'a, C: ClusterApi, R> {
    artifacts: ArtifactLedger<'a, R>,
    propagator: ParameterPropagator,
    session: Option<ClusterSession<'a, C>>,
}

/// Evaluates gates, dispatches stage actions and records terminal statuses.
pub struct Coordinator<'a, C, R, K> {
    pipeline: &'a PipelineDefinition,
    cluster: &'a C,
    registry: &'a R,
    clock: &'a K,
    sequencer: ProvisioningSequencer,
    issued: IssuedTags,
    http: reqwest::Client,
}

impl<'a, C: ClusterApi, R: Registry, K: Clock> Coordinator<'a, C, R, K> {
    pub fn new(
        pipeline: &'a PipelineDefinition,
        cluster: &'a C,
        registry: &'a R,
        clock: &'a K,
        applied: AppliedLedger,
        issued: IssuedTags,
    ) -> Result<Self> {
        Ok(Self {
            pipeline,
            cluster,
            registry,
            clock,
            sequencer: ProvisioningSequencer::new(applied),
            issued,
            http: health::create_client()?,
        })
    }

    /// Re-apply resource sets the ledger considers current.
    pub fn with_force(mut self, force: bool) -> Self {
        self.sequencer = self.sequencer.with_force(force);
        self
    }

    /// Execute `run`.
    ///
    /// Stage failures are recorded in the report; only an invalid invocation
    /// is returned as an error.
    pub async fn execute(&mut self, run: &PipelineRun, invocation: Invocation) -> Result<RunReport> {
        let pipeline = self.pipeline;

        let (stages, source): (Vec<&PipelineStage>, ParameterSource) = match invocation {
            Invocation::Automatic => (pipeline.stages.iter().collect(), ParameterSource::Propagated),
            Invocation::Direct { stage, parameters } => {
                if !matches!(run.cause(), TriggerCause::Manual | TriggerCause::Chained) {
                    return Err(DeployError::InvalidInvocation(format!(
                        "direct invocation requires a manual or chained cause, got `{}`",
                        run.cause()
                    )));
                }
                let target = pipeline.stage(&stage).ok_or_else(|| {
                    DeployError::InvalidInvocation(format!("unknown stage `{}`", stage))
                })?;
                if !target.definition.accepts(run.cause()) {
                    return Err(DeployError::InvalidInvocation(format!(
                        "stage `{}` ({}) cannot be invoked as `{}`",
                        stage,
                        target.definition.mode,
                        run.cause()
                    )));
                }
                (vec![target], ParameterSource::Supplied(parameters))
            }
        };
        let supplied = matches!(source, ParameterSource::Supplied(_));

        tracing::info!(
            run_id = %run.run_id(),
            cause = %run.cause(),
            revision = run.revision(),
            branch = run.branch(),
            stages = stages.len(),
            "Starting pipeline run"
        );

        let mut state = RunState {
            artifacts: ArtifactLedger::new(
                self.registry,
                pipeline.registry.clone(),
                pipeline.services.iter().cloned(),
                std::mem::take(&mut self.issued),
            ),
            propagator: ParameterPropagator::new(source),
            session: None,
        };
        let mut statuses: HashMap<StageId, StageStatus> = HashMap::new();
        let mut reports = Vec::with_capacity(stages.len());

        for stage in stages {
            let id = &stage.definition.id;
            let gate = trigger::resolve(
                &stage.definition,
                &TriggerInput {
                    cause: run.cause(),
                    branch: run.branch(),
                    changed_paths: run.changed_paths(),
                    upstream: if supplied {
                        UpstreamSignal::Supplied
                    } else {
                        UpstreamSignal::Statuses(&statuses)
                    },
                },
            );

            let mut provisioned = None;
            let outcome = match gate {
                Gate::Skip(reason) => match reason.failed_upstream().cloned() {
                    Some(upstream) => {
                        tracing::warn!(stage = %id, %upstream, "Upstream failed, failing stage");
                        StageOutcome::Failed(DeployError::UpstreamFailed { upstream })
                    }
                    None => {
                        tracing::info!(stage = %id, reason = %reason, "Stage skipped");
                        StageOutcome::Skipped(reason)
                    }
                },
                Gate::Run => {
                    tracing::info!(stage = %id, "Running stage");
                    match self.run_stage(stage, run, &mut state).await {
                        Ok(report) => {
                            tracing::info!(stage = %id, "Stage succeeded");
                            provisioned = report;
                            StageOutcome::Succeeded
                        }
                        Err(e) => {
                            tracing::error!(stage = %id, error = %e, "Stage failed");
                            StageOutcome::Failed(e)
                        }
                    }
                }
            };

            statuses.entry(id.clone()).or_insert(outcome.status());
            reports.push(StageReport {
                stage: id.clone(),
                outcome,
                provisioned,
            });
        }

        if let Some(session) = state.session.take() {
            if let Err(e) = session.close() {
                tracing::warn!(error = %e, "Failed to close cluster session");
            }
        }
        let outputs = state.propagator.outputs();
        self.issued = state.artifacts.into_issued();

        let report = RunReport {
            run_id: run.run_id(),
            stages: reports,
            outputs,
        };

        match report.first_failure() {
            Some((stage, e)) => tracing::error!(stage = %stage, error = %e, "Pipeline run failed"),
            None => tracing::info!(run_id = %run.run_id(), "Pipeline run complete"),
        }

        Ok(report)
    }

    /// Log in on first use; the session stays open until the run ends.
    async fn ensure_session(&self, session: &mut Option<ClusterSession<'a, C>>) -> Result<()> {
        if session.is_none() {
            *session = Some(ClusterSession::open(self.cluster).await?);
        }
        Ok(())
    }

    /// Run one stage's action, returning the provisioning outcome when it applied resources.
    async fn run_stage(
        &mut self,
        stage: &PipelineStage,
        run: &PipelineRun,
        state: &mut RunState<'a, C, R>,
    ) -> Result<Option<ProvisionReport>> {
        match &stage.action {
            StageAction::RunTests {
                program,
                args,
                working_dir,
            } => {
                let output = process::run(program, args, None, working_dir.as_deref()).await?;
                if !output.status.success() {
                    return Err(DeployError::CommandFailed {
                        command: shell_words::join(std::iter::once(program).chain(args)),
                        reason: output.failure_reason(),
                    });
                }
                tracing::debug!(stdout = %output.stdout.trim_end(), "Tests passed");
                Ok(None)
            }
            StageAction::RecordBuilds { services } => {
                for service in services {
                    state
                        .artifacts
                        .record_build(service, run.revision(), run.run_id())
                        .await?;
                }
                Ok(None)
            }
            StageAction::Provision { sets } => {
                self.ensure_session(&mut state.session).await?;
                self.provision(&stage.definition.id, sets).await.map(Some)
            }
            StageAction::DeployServices { sets } => {
                let sets = self.bind_images(sets, &state.artifacts)?;
                self.ensure_session(&mut state.session).await?;
                self.provision(&stage.definition.id, &sets).await.map(Some)
            }
            StageAction::DiscoverEndpoints { targets, policy } => {
                self.ensure_session(&mut state.session).await?;
                let parameters = self.discover(targets, *policy).await?;
                state.propagator.publish(&stage.definition.id, parameters);
                Ok(None)
            }
            StageAction::DeployFrontend(frontend) => {
                let inputs = state.propagator.consume(&stage.definition)?;
                let sets = self.render_frontend(frontend, &inputs, &state.artifacts)?;
                self.ensure_session(&mut state.session).await?;
                self.provision(&stage.definition.id, &sets).await.map(Some)
            }
        }
    }

    async fn provision(&mut self, stage: &StageId, sets: &[ResourceSet]) -> Result<ProvisionReport> {
        let report = self.sequencer.apply(self.cluster, sets).await?;
        for line in report.to_string().lines() {
            tracing::info!(stage = %stage, "{}", line);
        }
        Ok(report)
    }

    /// Replace image placeholders with this run's image references.
    fn bind_images(
        &self,
        sets: &[ResourceSet],
        artifacts: &ArtifactLedger<'a, R>,
    ) -> Result<Vec<ResourceSet>> {
        let tokens = artifacts.image_tokens()?;
        sets.iter()
            .map(|set| set.map_manifests(|m| self.pipeline.injector.inject(m, &tokens)))
            .collect()
    }

    /// Discover every target, check the health of the ones that declare a path, and map
    /// them to their parameters.
    async fn discover(&self, targets: &[DiscoveryTarget], policy: PollPolicy) -> Result<ParameterSet> {
        let services: BTreeSet<String> = targets.iter().map(|t| t.service.clone()).collect();
        let endpoints = EndpointPoller::new(self.cluster, self.clock, policy)
            .discover(&services)
            .await?;

        let mut parameters = ParameterSet::new();
        for target in targets {
            let endpoint = endpoints
                .get(&target.service)
                .with_context(|| format!("No endpoint for {}", target.service))?;
            let url = endpoint.url(target.port)?;

            if let Some(check) = &target.health {
                health::wait_until_healthy(&self.http, self.clock, &target.service, &url, check)
                    .await?;
            }

            parameters.insert(
                target.parameter.clone(),
                url.as_str().trim_end_matches('/'),
            );
        }
        Ok(parameters)
    }

    /// The ConfigMap holding the rewritten artifact, then the frontend sets.
    fn render_frontend(
        &self,
        frontend: &FrontendDeployment,
        inputs: &ParameterSet,
        artifacts: &ArtifactLedger<'a, R>,
    ) -> Result<Vec<ResourceSet>> {
        let tokens = frontend
            .bindings
            .iter()
            .map(|(placeholder, parameter)| {
                let value = inputs.get(parameter).with_context(|| {
                    format!("Parameter {} bound to {} was not consumed", parameter, placeholder)
                })?;
                Ok((placeholder.clone(), value.clone()))
            })
            .collect::<anyhow::Result<BTreeMap<_, _>>>()?;

        let content = std::fs::read_to_string(&frontend.artifact).with_context(|| {
            format!("Failed to read frontend artifact {}", frontend.artifact.display())
        })?;
        let rewritten = self.pipeline.injector.inject(&content, &tokens)?;

        let config = ResourceSet::new(
            frontend.config_map.clone(),
            vec![ResourceDefinition::config_map(
                &frontend.config_map,
                &self.pipeline.namespace,
                &frontend.config_key,
                &rewritten,
            )],
        );

        let mut sets = vec![config];
        sets.extend(self.bind_images(&frontend.sets, artifacts)?);
        Ok(sets)
    }
}
