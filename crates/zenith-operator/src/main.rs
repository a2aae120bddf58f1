//! Zenith Operator - source-to-URL serverless functions on Kubernetes

mod config;
mod controller_runner;

use clap::{Parser, Subcommand};
use kube::CustomResourceExt;

use zenith_common::crd::Function;
use zenith_common::kube_utils::{create_client, ensure_crd};
use zenith_common::telemetry::{init_telemetry, TelemetryConfig};

use crate::config::OperatorConfig;
use crate::controller_runner::build_function_controller;

/// Zenith - builds, deploys and subscribes Function resources
#[derive(Parser, Debug)]
#[command(name = "zenith-operator", version, about, long_about = None)]
struct Cli {
    /// Print the Function CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Function controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Function::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let tracer_provider = init_telemetry(TelemetryConfig::default())?;

    let result = match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli.config).await,
    };

    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }

    result
}

async fn run_controller(config: &OperatorConfig) -> anyhow::Result<()> {
    let client = create_client(config.kubeconfig.as_deref()).await?;

    tracing::info!("Installing Function CRD...");
    ensure_crd::<Function>(&client).await?;

    tracing::info!("Starting Zenith controllers...");
    build_function_controller(client, config.controller_config()).await;

    tracing::info!("Zenith controller shutting down");
    Ok(())
}
