//! stagehand coordinates the stages of a build, provision and deploy pipeline.

mod cli;
mod config;
mod summary;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command, ExecArgs};
use stagehand_deploy::{
    AppliedLedger, Coordinator, DockerRegistry, EnvironmentLock, Invocation, IssuedTags,
    KubectlCluster, PipelineConfig, PipelineDefinition, PipelineRun, TokioClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match cli.command {
        Command::Init { environment, force } => {
            let path = config::config_file(&cli.config);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists, pass --force to overwrite it",
                    path.display()
                );
            }
            PipelineConfig::example(environment).save_to_file(&path)?;
            Ok(())
        }

        Command::Plan { event } => {
            let loaded = config::load(&cli.config)?;
            let pipeline = PipelineDefinition::standard(&loaded.config, &loaded.base_dir)?;
            let run = event.to_run()?;

            println!("{}", summary::plan_table(&pipeline.plan(&run)));
            Ok(())
        }

        Command::Run { event, exec } => {
            let run = event.to_run()?;
            execute(&cli.config, &run, Invocation::Automatic, &exec).await
        }

        Command::Invoke {
            stage,
            mode,
            params,
            params_file,
            source,
            exec,
        } => {
            let parameters = cli::collect_parameters(&params, params_file.as_ref())?;
            let run = PipelineRun::new(
                source.run_id(),
                mode.into(),
                source.revision.clone(),
                source.branch.clone(),
                Vec::<String>::new(),
            );
            let invocation = Invocation::Direct {
                stage: stage.into(),
                parameters,
            };
            execute(&cli.config, &run, invocation, &exec).await
        }
    }
}

/// Execute a run under the environment lock and report the outcome.
async fn execute(
    config_path: &std::path::Path,
    run: &PipelineRun,
    invocation: Invocation,
    exec: &ExecArgs,
) -> Result<()> {
    let loaded = config::load(config_path)?;
    let state_dir = loaded.state_dir();

    let environment = loaded.config.environment.as_str();
    let _lock = EnvironmentLock::acquire(&state_dir, environment)?;

    let pipeline = PipelineDefinition::standard(&loaded.config, &loaded.base_dir)?;
    let cluster = KubectlCluster::new(loaded.config.cluster.clone());
    let registry = DockerRegistry::new(&loaded.config.registry)?;
    let applied =
        AppliedLedger::for_environment(&state_dir, environment, &loaded.config.cluster.target())?;
    let issued = IssuedTags::for_environment(&state_dir, environment)?;

    let mut coordinator =
        Coordinator::new(&pipeline, &cluster, &registry, &TokioClock, applied, issued)?
            .with_force(exec.force);
    let report = coordinator.execute(run, invocation).await?;

    println!("{}", summary::run_table(&report));
    if let Some(table) = summary::outputs_table(&report) {
        println!("{}", table);
    }

    if let Some(outputs) = &exec.outputs {
        report
            .outputs
            .append_outputs(outputs)
            .context("Failed to export stage outputs")?;
    }

    report.into_result()?;
    Ok(())
}
