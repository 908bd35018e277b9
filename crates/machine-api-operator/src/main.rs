//! Machine API operator binary

use clap::Parser;
use kube::{Client, CustomResourceExt};

use machine_api_common::crd::{Machine, MachineSet};
use machine_api_common::telemetry::{init_telemetry, TelemetryConfig};
use machine_api_operator::config::{Cli, Command, ManagerArgs};
use machine_api_operator::controller_runner::{build_drain_controller, build_nodelink_controller};
use machine_api_operator::manager::{
    run_controllers, CONTROLLER_LEASE, DRAIN_LEASE, NODELINK_LEASE,
};
use machine_api_operator::webhook_server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Command::Controller(args) | Command::NodeLink(args) | Command::Drain(args) => {
            args.log_level.clone()
        }
        Command::Webhook(args) => args.log_level.clone(),
        Command::Crd => {
            let machine = serde_yaml::to_string(&Machine::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize Machine CRD: {}", e))?;
            let machine_set = serde_yaml::to_string(&MachineSet::crd())
                .map_err(|e| anyhow::anyhow!("Failed to serialize MachineSet CRD: {}", e))?;
            println!("{machine}---\n{machine_set}");
            return Ok(());
        }
    };

    init_telemetry(&TelemetryConfig {
        service_name: "machine-api-operator".to_string(),
        log_level,
    })?;

    let client = Client::try_default().await?;

    match cli.command {
        Command::Controller(args) => run_manager(client, &args, CONTROLLER_LEASE, true, true).await,
        Command::NodeLink(args) => run_manager(client, &args, NODELINK_LEASE, false, true).await,
        Command::Drain(args) => run_manager(client, &args, DRAIN_LEASE, true, false).await,
        Command::Webhook(args) => webhook_server::run(client, &args).await,
        Command::Crd => Ok(()),
    }
}

async fn run_manager(
    client: Client,
    args: &ManagerArgs,
    lease_name: &str,
    drain: bool,
    nodelink: bool,
) -> anyhow::Result<()> {
    let namespace = args.watch_namespace();
    let mut controllers = Vec::new();
    tracing::info!("Building controllers");
    if drain {
        controllers.extend(build_drain_controller(client.clone(), namespace));
    }
    if nodelink {
        controllers.extend(build_nodelink_controller(client.clone(), namespace));
    }
    run_controllers(client, args, lease_name, controllers).await
}
