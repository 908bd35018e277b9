//! Process supervision: leader election around a set of controllers

use std::sync::Arc;

use futures::future::join_all;
use kube::Client;
use tracing::{info, warn};

use machine_api_common::leader_election::LeaderElector;
use machine_api_machine::Actuator;

use crate::config::ManagerArgs;
use crate::controller_runner::{build_machine_controller, ControllerFuture};

/// Lease held by the drain and node link controllers
pub const CONTROLLER_LEASE: &str = "machine-api-controllers-leader";

/// Lease held by a standalone node link controller
pub const NODELINK_LEASE: &str = "machine-api-nodelink-leader";

/// Lease held by a standalone drain controller
pub const DRAIN_LEASE: &str = "machine-api-drain-leader";

/// Lease held by a provider's machine controller
pub const MACHINE_CONTROLLER_LEASE: &str = "machine-api-machine-controller-leader";

/// Identity written into the lease: the pod name when known
pub fn leader_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("machine-api-{}", std::process::id()))
}

/// Run `controllers` until they stop, holding `lease_name` first when
/// leader election is enabled
///
/// Losing the lease is an error; the process must exit rather than keep
/// reconciling unelected.
pub async fn run_controllers(
    client: Client,
    args: &ManagerArgs,
    lease_name: &str,
    controllers: Vec<ControllerFuture>,
) -> anyhow::Result<()> {
    if !args.leader_elect {
        info!(count = controllers.len(), "Starting controllers without leader election");
        join_all(controllers).await;
        return Ok(());
    }

    let identity = leader_identity();
    let elector = Arc::new(
        LeaderElector::new(
            client,
            lease_name,
            &args.leader_elect_resource_namespace,
            &identity,
        )
        .with_lease_duration(args.leader_elect_lease_duration),
    );

    let mut guard = elector.acquire().await?;
    info!(%identity, lease = %lease_name, "Acquired leadership, starting controllers");

    let lost = tokio::select! {
        _ = join_all(controllers) => false,
        _ = guard.lost() => true,
    };

    if lost {
        anyhow::bail!("lost leadership of lease {lease_name}");
    }

    if let Err(e) = guard.release().await {
        warn!(error = %e, "Failed to release leader lease");
    }
    Ok(())
}

/// Run the Machine controller for a provider actuator
///
/// Provider binaries call this with their own [`Actuator`]. Draining runs
/// in the `controller` process.
pub async fn run_machine_manager(
    client: Client,
    args: &ManagerArgs,
    actuator: Arc<dyn Actuator>,
) -> anyhow::Result<()> {
    let controllers = build_machine_controller(client.clone(), args.watch_namespace(), actuator);
    run_controllers(client, args, MACHINE_CONTROLLER_LEASE, controllers).await
}
