//! Controller runner: builds controller futures for each reconciler
//!
//! Each `build_*` function returns a Vec of boxed futures so the caller can
//! decide which reconcilers share a process and a leader lease.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use machine_api_common::crd::Machine;
use machine_api_machine::Actuator;
use machine_api_nodelink::MachineIndex;

/// Watcher timeout (seconds), kept below the client read timeout (30s)
/// so idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller loop that runs until shutdown
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Machines in `namespace`, or in every namespace when `None`
pub fn machines_api(client: Client, namespace: Option<&str>) -> Api<Machine> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build the Machine phase controller around a provider actuator
pub fn build_machine_controller(
    client: Client,
    namespace: Option<&str>,
    actuator: Arc<dyn Actuator>,
) -> Vec<ControllerFuture> {
    use machine_api_machine::{error_policy, reconcile, Context};

    let ctx = Arc::new(Context::builder(client.clone(), actuator).build());
    let machines = machines_api(client, namespace);

    tracing::info!("- Machine controller");

    vec![Box::pin(
        Controller::new(machines, watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Machine")),
    )]
}

/// Build the drain controller
pub fn build_drain_controller(client: Client, namespace: Option<&str>) -> Vec<ControllerFuture> {
    use machine_api_drain::{error_policy, reconcile, Context};

    let ctx = Arc::new(Context::new(client.clone()));
    let machines = machines_api(client, namespace);

    tracing::info!("- Drain controller");

    vec![Box::pin(
        Controller::new(machines, watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Drain")),
    )]
}

/// Build the node link controller
///
/// Nodes are the primary resource. A separate Machine watch keeps the
/// lookup index current and re-queues every Node whenever it changes, so a
/// Node seen before its Machine still gets linked.
pub fn build_nodelink_controller(
    client: Client,
    namespace: Option<&str>,
) -> Vec<ControllerFuture> {
    use machine_api_nodelink::{error_policy, reconcile, watch_machines, Context};

    let index = Arc::new(MachineIndex::default());
    let ctx = Arc::new(Context::new(client.clone(), index.clone()));
    let nodes: Api<Node> = Api::all(client.clone());
    let machines = machines_api(client, namespace);

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let machine_watch = watch_machines(machines, watcher_config(), index, trigger_tx);

    let controller = Controller::new(nodes, watcher_config())
        .reconcile_all_on(ReceiverStream::new(trigger_rx))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("NodeLink"));

    tracing::info!("- NodeLink controller");

    vec![Box::pin(async move {
        tokio::select! {
            _ = controller => {}
            _ = machine_watch => tracing::warn!("machine watch ended"),
        }
    })]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
