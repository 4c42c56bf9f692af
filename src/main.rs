//! ecs-deploy - ECS deployment and rollback orchestration
//!
//! ## Usage
//!
//! ```bash
//! # Register fresh revisions, run one-off executions, deploy all services
//! ecs-deploy --config ecs-deploy.json deploy
//!
//! # Walk every service back two revisions and clean up obsolete ones
//! STEP=2 ecs-deploy --config ecs-deploy.json rollback
//!
//! # Run the one-off executions only (e.g. migrations)
//! ecs-deploy --config ecs-deploy.json run
//!
//! # Read-only status snapshot
//! ecs-deploy --config ecs-deploy.json status
//! ```
//!
//! `TARGET_CLUSTER` and `TARGET_TASK_DEFINITION` narrow an invocation to an
//! allowlist of clusters / families without editing the config file.

use clap::{Parser, Subcommand};
use ecs_deploy::{DeployConfig, MultiRegionCoordinator};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ECS deployment and rollback orchestration
#[derive(Parser)]
#[command(name = "ecs-deploy")]
#[command(about = "Deploy, roll back and run containerized workloads on ECS", long_about = None)]
struct Cli {
    /// Path to the deployment configuration file
    #[arg(long, default_value = "ecs-deploy.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register revisions, run executions, then deploy all services
    Deploy,

    /// Roll services back and deregister obsolete revisions
    Rollback {
        /// Revisions to walk backward (overrides config and STEP)
        #[arg(long)]
        step: Option<usize>,
    },

    /// Register fresh revisions and run the one-off executions
    Run,

    /// Register a revision for every task definition
    Register,

    /// Register fresh revisions for definitions with executions
    RegisterRun,

    /// Read-only status snapshot of every service
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ecs_deploy=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = DeployConfig::load(&cli.config)?;
    let rollback_step = config.rollback_step;
    let mut coordinator = MultiRegionCoordinator::new(config)?;
    info!("regions: [{}]", coordinator.regions().join(", "));

    // Ctrl-C aborts between poll attempts instead of mid-flight.
    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            signal_token.cancel();
        }
    });

    match cli.command {
        Commands::Deploy => {
            coordinator.set_revision()?;
            coordinator.register_for_run().await?;
            coordinator.run(&cancel).await?;
            coordinator.register_for_deploy().await?;
            coordinator.deploy(&cancel).await?;
            info!("deploy complete");
        }

        Commands::Rollback { step } => {
            let step = step.unwrap_or(rollback_step);
            coordinator.rollback(step, &cancel).await?;
            info!("rollback complete");
        }

        Commands::Run => {
            coordinator.set_revision()?;
            coordinator.register_for_run().await?;
            coordinator.run(&cancel).await?;
            info!("run complete");
        }

        Commands::Register => {
            coordinator.set_revision()?;
            coordinator.register_for_deploy().await?;
            info!("register complete");
        }

        Commands::RegisterRun => {
            coordinator.set_revision()?;
            coordinator.register_for_run().await?;
            info!("register complete");
        }

        Commands::Status => {
            coordinator.display_status().await?;
        }
    }

    Ok(())
}
