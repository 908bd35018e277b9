//! Node link controller
//!
//! Reconciles Nodes. The Machine side is kept in a [`MachineIndex`] fed by
//! [`watch_machines`], which also pokes the Node controller so that a
//! Machine reporting its addresses after the Node registered still gets
//! linked. Both orders converge on the same result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, ObjectReference, Taint};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use machine_api_common::backoff::ErrorBackoff;
use machine_api_common::crd::Machine;
use machine_api_common::events::{
    actions, reasons as event_reasons, EventPublisher, KubeEventPublisher,
};
use machine_api_common::{Error, MACHINE_ANNOTATION};

use crate::index::MachineIndex;
use crate::merge::{merge_taints, missing_labels};

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
const FIELD_MANAGER: &str = "machine-nodelink-controller";

/// Additions to write onto a Node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeUpdate {
    /// Provider ID to set; only ever present when the Node has none
    pub provider_id: Option<String>,
    /// Full taint list after the additive merge
    pub taints: Option<Vec<Taint>>,
    /// Labels the Node is missing
    pub labels: BTreeMap<String, String>,
    /// Annotations to set
    pub annotations: BTreeMap<String, String>,
}

impl NodeUpdate {
    /// Whether applying this update would change nothing
    pub fn is_empty(&self) -> bool {
        self.provider_id.is_none()
            && self.taints.is_none()
            && self.labels.is_empty()
            && self.annotations.is_empty()
    }
}

/// Kubernetes operations the node linker performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLinkClient: Send + Sync {
    /// Apply additions to a Node, guarded by its resourceVersion
    async fn patch_node(&self, node: &Node, update: &NodeUpdate) -> Result<(), Error>;

    /// Record the Node reference on a Machine's status
    async fn link_machine(&self, machine: &Machine, node_ref: &ObjectReference)
        -> Result<(), Error>;
}

/// Production [`NodeLinkClient`]
pub struct NodeLinkClientImpl {
    client: Client,
}

impl NodeLinkClientImpl {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLinkClient for NodeLinkClientImpl {
    async fn patch_node(&self, node: &Node, update: &NodeUpdate) -> Result<(), Error> {
        let mut patch = json!({ "metadata": { "resourceVersion": node.resource_version() } });
        if !update.labels.is_empty() {
            patch["metadata"]["labels"] = json!(update.labels);
        }
        if !update.annotations.is_empty() {
            patch["metadata"]["annotations"] = json!(update.annotations);
        }
        if let Some(id) = &update.provider_id {
            patch["spec"]["providerID"] = json!(id);
        }
        if let Some(taints) = &update.taints {
            patch["spec"]["taints"] = json!(taints);
        }

        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            &node.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from(e).for_resource(node.name_any()))?;
        Ok(())
    }

    async fn link_machine(
        &self,
        machine: &Machine,
        node_ref: &ObjectReference,
    ) -> Result<(), Error> {
        let patch = json!({
            "metadata": { "resourceVersion": machine.resource_version() },
            "status": { "nodeRef": node_ref, "lastUpdated": Utc::now() }
        });
        let api: Api<Machine> = Api::namespaced(
            self.client.clone(),
            &machine.namespace().unwrap_or_default(),
        );
        api.patch_status(
            &machine.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from(e).for_resource(machine.key()))?;
        Ok(())
    }
}

/// Shared state for the node link controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn NodeLinkClient>,
    /// Machines by provider ID and address
    pub index: Arc<MachineIndex>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Per-Node error backoff
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a production context around a shared index
    pub fn new(client: Client, index: Arc<MachineIndex>) -> Self {
        Self {
            kube: Arc::new(NodeLinkClientImpl::new(client.clone())),
            index,
            events: Arc::new(KubeEventPublisher::new(client, "machine-nodelink-controller")),
            backoff: ErrorBackoff::default(),
        }
    }

    /// Create a context from explicit collaborators
    pub fn with_clients(
        kube: Arc<dyn NodeLinkClient>,
        index: Arc<MachineIndex>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            index,
            events,
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Additions `machine` asks of `node`
pub fn desired_node_update(node: &Node, machine: &Machine) -> NodeUpdate {
    let node_spec = node.spec.clone().unwrap_or_default();

    let provider_id = match (node_spec.provider_id.as_deref(), machine.provider_id()) {
        (None | Some(""), Some(id)) => Some(id.to_string()),
        _ => None,
    };

    let taints = merge_taints(
        node_spec.taints.as_deref().unwrap_or(&[]),
        &machine.spec.taints,
    );

    let labels = missing_labels(node.labels(), &machine.spec.metadata.labels);

    let key = machine.key();
    let mut annotations = BTreeMap::new();
    if node.annotations().get(MACHINE_ANNOTATION) != Some(&key) {
        annotations.insert(MACHINE_ANNOTATION.to_string(), key);
    }

    NodeUpdate {
        provider_id,
        taints,
        labels,
        annotations,
    }
}

fn node_ref(node: &Node) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(node.name_any()),
        uid: node.uid(),
        ..Default::default()
    }
}

fn is_linked(machine: &Machine, node: &Node) -> bool {
    machine
        .status
        .as_ref()
        .and_then(|s| s.node_ref.as_ref())
        .is_some_and(|r| r.name.as_deref() == Some(node.name_any().as_str()) && r.uid == node.uid())
}

/// Link a Node to its Machine
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(machine) = ctx.index.find_for_node(&node) else {
        debug!("no machine matches node");
        return Ok(Action::await_change());
    };

    let update = desired_node_update(&node, &machine);
    if !update.is_empty() {
        debug!(machine = %machine.key(), ?update, "updating node from machine");
        ctx.kube.patch_node(&node, &update).await?;
    }

    if !is_linked(&machine, &node) {
        let reference = node_ref(&node);
        ctx.kube.link_machine(&machine, &reference).await?;
        info!(machine = %machine.key(), "linked machine to node");
        ctx.events
            .publish(
                &machine.object_ref(&()),
                EventType::Normal,
                event_reasons::LINKED,
                actions::LINK,
                Some(format!("Linked to node {}", node.name_any())),
            )
            .await;
    }

    ctx.backoff.reset(&node.name_any());
    Ok(Action::await_change())
}

/// Error policy for the node link controller
pub fn error_policy(node: Arc<Node>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = node.name_any();
    if error.is_conflict() {
        debug!(node = %name, "write conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    let delay = ctx.backoff.next_delay(&name);
    error!(?error, node = %name, retry_secs = delay.as_secs(), "node link failed");
    Action::requeue(delay)
}

/// Fold one Machine watch event into the index
///
/// Returns whether the Node controller should re-run. Events inside a
/// relist are batched into a single trigger at its end.
pub fn apply_machine_event(index: &MachineIndex, event: Event<Machine>) -> bool {
    match event {
        Event::Init => {
            index.clear();
            false
        }
        Event::InitApply(machine) => {
            index.upsert(machine);
            false
        }
        Event::InitDone => true,
        Event::Apply(machine) => {
            index.upsert(machine);
            true
        }
        Event::Delete(machine) => {
            index.remove(&machine);
            true
        }
    }
}

/// Keep `index` in sync with the Machines visible through `api`
///
/// Sends on `trigger` whenever the index changed; a full channel means a
/// trigger is already pending and the send is skipped. Returns when the
/// receiving side goes away.
pub async fn watch_machines(
    api: Api<Machine>,
    config: watcher::Config,
    index: Arc<MachineIndex>,
    trigger: mpsc::Sender<()>,
) {
    let mut events = watcher::watcher(api, config).default_backoff().boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if !apply_machine_event(&index, event) {
                    continue;
                }
                if let Err(TrySendError::Closed(_)) = trigger.try_send(()) {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "machine watch failed"),
        }
    }
}
