//! Drain controller
//!
//! Acts on Machines being deleted whose `Drained` condition is not yet
//! True. Pre-drain hooks hold the drain back; once they are gone the node
//! is cordoned and emptied, and the result lands on the Machine for the
//! Machine controller to pick up.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource};
use tracing::{debug, error, info, instrument, warn};

use machine_api_common::backoff::ErrorBackoff;
use machine_api_common::conditions::{self, reasons};
use machine_api_common::crd::{Condition, ConditionSeverity, ConditionStatus, Machine};
use machine_api_common::events::{
    actions, reasons as event_reasons, EventPublisher, KubeEventPublisher,
};
use machine_api_common::lifecycle_hooks::describe;
use machine_api_common::Error;

use crate::drain::{drain_node, DrainClient, DrainOptions, DrainOutcome, KubeDrainClient};

const DRAIN_REQUEUE: Duration = Duration::from_secs(20);
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

const DRAIN_SKIPPED_MESSAGE: &str = "Node drain skipped";
const NODE_NOT_FOUND_MESSAGE: &str = "Node not found";
const DRAIN_SUCCEEDED_MESSAGE: &str = "Drain finished successfully";

/// Shared state for the drain controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn DrainClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Per-Machine error backoff
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a production context
    pub fn new(client: Client) -> Self {
        Self {
            kube: Arc::new(KubeDrainClient::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, "machine-drain-controller")),
            backoff: ErrorBackoff::default(),
        }
    }

    /// Create a context from explicit collaborators
    pub fn with_clients(kube: Arc<dyn DrainClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            kube,
            events,
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Whether the drain controller has work to do for this Machine
pub fn needs_drain(machine: &Machine) -> bool {
    machine.is_deleting()
        && !machine.is_paused()
        && !conditions::is_true(machine, conditions::MACHINE_DRAINED)
}

/// Reconcile the drain of a deleting Machine's node
#[instrument(skip(machine, ctx), fields(machine = %machine.key()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let result = drain_machine(&machine, &ctx).await;
    if result.is_ok() {
        ctx.backoff.reset(&machine.key());
    }
    result
}

async fn drain_machine(original: &Machine, ctx: &Context) -> Result<Action, Error> {
    if !needs_drain(original) {
        return Ok(Action::await_change());
    }
    let mut machine = original.clone();

    let node_name = match machine.node_name() {
        Some(node) if !machine.excluded_from_drain() => node.to_string(),
        _ => {
            info!("skipping node drain");
            mark_drained(original, &mut machine, ctx, DRAIN_SKIPPED_MESSAGE).await?;
            return Ok(Action::await_change());
        }
    };

    let pre_drain = &machine.spec.lifecycle_hooks.pre_drain;
    if !pre_drain.is_empty() {
        let message = format!(
            "Drain operation currently blocked by: {}",
            describe(pre_drain)
        );
        info!(node = %node_name, hooks = %describe(pre_drain), "drain blocked by pre-drain hooks");
        publish(
            ctx,
            &machine,
            EventType::Warning,
            event_reasons::DRAIN_BLOCKED,
            message,
        )
        .await;
        return Ok(Action::await_change());
    }

    let Some(node) = ctx.kube.get_node(&node_name).await? else {
        info!(node = %node_name, "node not found, treating as drained");
        mark_drained(original, &mut machine, ctx, NODE_NOT_FOUND_MESSAGE).await?;
        return Ok(Action::await_change());
    };

    publish(
        ctx,
        &machine,
        EventType::Normal,
        event_reasons::DRAIN_PROCEEDS,
        format!("Node drain proceeds for {node_name}"),
    )
    .await;

    ctx.kube.cordon(&node_name).await?;
    let options = DrainOptions::for_node(&node);
    if options.grace_period_secs.is_some() {
        warn!(node = %node_name, "node is unreachable, draining with a short grace period");
    }

    match drain_node(ctx.kube.as_ref(), &node_name, &options).await {
        Ok(DrainOutcome::Drained { evicted }) => {
            info!(node = %node_name, evicted, "drain finished");
            mark_drained(original, &mut machine, ctx, DRAIN_SUCCEEDED_MESSAGE).await?;
            publish(
                ctx,
                &machine,
                EventType::Normal,
                event_reasons::DRAIN_SUCCEEDED,
                format!("Node drain succeeded for {node_name}"),
            )
            .await;
            Ok(Action::await_change())
        }
        Ok(DrainOutcome::TimedOut { pods }) => {
            publish(
                ctx,
                &machine,
                EventType::Normal,
                event_reasons::DRAIN_REQUEUED,
                format!("Drain of {node_name} waiting on {}", pods.join(", ")),
            )
            .await;
            Ok(Action::requeue(DRAIN_REQUEUE))
        }
        Err(e) => {
            conditions::mark(
                &mut machine,
                conditions::false_condition(
                    conditions::MACHINE_DRAINED,
                    reasons::MACHINE_DRAIN_ERROR,
                    ConditionSeverity::Warning,
                    format!("could not drain machine: {e}"),
                ),
            );
            write_status(original, &mut machine, ctx).await?;
            publish(
                ctx,
                &machine,
                EventType::Warning,
                event_reasons::DRAIN_FAILED,
                format!("Node drain failed for {node_name}: {e}"),
            )
            .await;
            Err(e)
        }
    }
}

async fn mark_drained(
    original: &Machine,
    machine: &mut Machine,
    ctx: &Context,
    message: &str,
) -> Result<(), Error> {
    conditions::mark(
        machine,
        Condition::new(conditions::MACHINE_DRAINED, ConditionStatus::True, "", message),
    );
    write_status(original, machine, ctx).await
}

async fn write_status(original: &Machine, machine: &mut Machine, ctx: &Context) -> Result<(), Error> {
    let previous = original.status.clone().unwrap_or_default();
    let status = machine.status.get_or_insert_with(Default::default);
    conditions::merge_from(&mut status.conditions, &previous.conditions);
    if !status.content_differs(&previous) {
        return Ok(());
    }
    status.last_updated = Some(chrono::Utc::now());
    ctx.kube.patch_machine_status(machine).await
}

async fn publish(ctx: &Context, machine: &Machine, type_: EventType, reason: &str, note: String) {
    ctx.events
        .publish(&machine.object_ref(&()), type_, reason, actions::DRAIN, Some(note))
        .await;
}

/// Error policy for the drain controller
pub fn error_policy(machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = machine.key();
    if error.is_conflict() {
        debug!(machine = %key, "write conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    let delay = ctx.backoff.next_delay(&key);
    error!(?error, machine = %key, retry_secs = delay.as_secs(), "drain failed");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use machine_api_common::crd::{
        AuthoritativeApi, LifecycleHook, MachineSpec, MachineStatus,
    };
    use machine_api_common::events::NoopEventPublisher;
    use machine_api_common::{EXCLUDE_NODE_DRAINING_ANNOTATION, MACHINE_FINALIZER};

    use crate::drain::{EvictionResult, MockDrainClient};

    mockall::mock! {
        Events {}

        #[async_trait]
        impl EventPublisher for Events {
            async fn publish(
                &self,
                resource_ref: &ObjectReference,
                type_: EventType,
                reason: &str,
                action: &str,
                note: Option<String>,
            );
        }
    }

    fn deleting_machine(name: &str, node: Option<&str>) -> Machine {
        Machine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("openshift-machine-api".to_string()),
                finalizers: Some(vec![MACHINE_FINALIZER.to_string()]),
                deletion_timestamp: Some(Time(Utc::now())),
                ..Default::default()
            },
            spec: MachineSpec::default(),
            status: Some(MachineStatus {
                node_ref: node.map(|n| ObjectReference {
                    name: Some(n.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }
    }

    fn web_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    type Statuses = Arc<Mutex<Vec<MachineStatus>>>;

    fn capturing_client() -> (MockDrainClient, Statuses) {
        let statuses: Statuses = Arc::default();
        let mut client = MockDrainClient::new();
        let s = statuses.clone();
        client.expect_patch_machine_status().returning(move |m| {
            s.lock().unwrap().push(m.status.clone().unwrap_or_default());
            Ok(())
        });
        (client, statuses)
    }

    fn drained_condition(statuses: &Statuses) -> Condition {
        statuses
            .lock()
            .unwrap()
            .last()
            .and_then(|s| {
                s.conditions
                    .iter()
                    .find(|c| c.type_ == conditions::MACHINE_DRAINED)
                    .cloned()
            })
            .expect("Drained condition should be written")
    }

    fn context(client: MockDrainClient) -> Arc<Context> {
        Arc::new(Context::with_clients(
            Arc::new(client),
            Arc::new(NoopEventPublisher),
        ))
    }

    #[tokio::test]
    async fn story_pre_drain_hook_blocks_drain_with_event() {
        let mut client = MockDrainClient::new();
        client.expect_get_node().never();
        client.expect_cordon().never();
        client.expect_patch_machine_status().never();

        let mut events = MockEvents::new();
        events
            .expect_publish()
            .withf(|_, type_, reason, action, note| {
                *type_ == EventType::Warning
                    && reason == event_reasons::DRAIN_BLOCKED
                    && action == actions::DRAIN
                    && note
                        .as_deref()
                        .is_some_and(|n| n.contains("{Name:migrate Owner:storage}"))
            })
            .times(1)
            .returning(|_, _, _, _, _| ());

        let mut machine = deleting_machine("delete-predrain", Some("node-a"));
        machine.spec.lifecycle_hooks.pre_drain = vec![LifecycleHook::new("migrate", "storage")];

        let ctx = Arc::new(Context::with_clients(Arc::new(client), Arc::new(events)));
        let action = reconcile(Arc::new(machine), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn story_machine_without_node_skips_drain() {
        let (mut client, statuses) = capturing_client();
        client.expect_get_node().never();

        let action = reconcile(Arc::new(deleting_machine("delete", None)), context(client))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        let drained = drained_condition(&statuses);
        assert_eq!(drained.status, ConditionStatus::True);
        assert_eq!(drained.message, DRAIN_SKIPPED_MESSAGE);
    }

    #[tokio::test]
    async fn exclusion_annotation_skips_drain() {
        let (mut client, statuses) = capturing_client();
        client.expect_get_node().never();

        let mut machine = deleting_machine("excluded", Some("node-a"));
        machine.metadata.annotations = Some(BTreeMap::from([(
            EXCLUDE_NODE_DRAINING_ANNOTATION.to_string(),
            String::new(),
        )]));
        reconcile(Arc::new(machine), context(client)).await.unwrap();

        assert_eq!(drained_condition(&statuses).message, DRAIN_SKIPPED_MESSAGE);
    }

    #[tokio::test]
    async fn missing_node_counts_as_drained() {
        let (mut client, statuses) = capturing_client();
        client.expect_get_node().returning(|_| Ok(None));
        client.expect_cordon().never();

        reconcile(
            Arc::new(deleting_machine("gone-node", Some("node-a"))),
            context(client),
        )
        .await
        .unwrap();

        let drained = drained_condition(&statuses);
        assert_eq!(drained.status, ConditionStatus::True);
        assert_eq!(drained.message, NODE_NOT_FOUND_MESSAGE);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_drain_cordons_and_marks_drained() {
        let (mut client, statuses) = capturing_client();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(Node::default())));
        client
            .expect_cordon()
            .withf(|name| name == "node-a")
            .times(1)
            .returning(|_| Ok(()));
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![web_pod()]));
        client
            .expect_evict_pod()
            .returning(|_, _, _| Ok(EvictionResult::Evicted));
        client.expect_get_pod().returning(|_, _| Ok(None));

        let mut events = MockEvents::new();
        let reasons_seen = Arc::new(Mutex::new(Vec::new()));
        let r = reasons_seen.clone();
        events.expect_publish().returning(move |_, _, reason, _, _| {
            r.lock().unwrap().push(reason.to_string());
        });

        let ctx = Arc::new(Context::with_clients(Arc::new(client), Arc::new(events)));
        let action = reconcile(Arc::new(deleting_machine("drain", Some("node-a"))), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        let drained = drained_condition(&statuses);
        assert_eq!(drained.status, ConditionStatus::True);
        assert_eq!(drained.message, DRAIN_SUCCEEDED_MESSAGE);
        assert_eq!(
            *reasons_seen.lock().unwrap(),
            vec![event_reasons::DRAIN_PROCEEDS, event_reasons::DRAIN_SUCCEEDED]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_eviction_requeues_without_error() {
        let mut client = MockDrainClient::new();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(Node::default())));
        client.expect_cordon().returning(|_| Ok(()));
        client
            .expect_list_pods_on_node()
            .returning(|_| Ok(vec![web_pod()]));
        client
            .expect_evict_pod()
            .returning(|_, _, _| Ok(EvictionResult::Blocked("budget".into())));
        client.expect_patch_machine_status().never();

        let action = reconcile(
            Arc::new(deleting_machine("pdb", Some("node-a"))),
            context(client),
        )
        .await
        .unwrap();

        assert_eq!(action, Action::requeue(DRAIN_REQUEUE));
    }

    #[tokio::test]
    async fn drain_failure_is_recorded_on_the_machine() {
        let (mut client, statuses) = capturing_client();
        client
            .expect_get_node()
            .returning(|_| Ok(Some(Node::default())));
        client.expect_cordon().returning(|_| Ok(()));
        client
            .expect_list_pods_on_node()
            .returning(|_| Err(Error::drain("node-a", "list pods forbidden")));

        let result = reconcile(
            Arc::new(deleting_machine("broken", Some("node-a"))),
            context(client),
        )
        .await;

        assert!(result.is_err());
        let drained = drained_condition(&statuses);
        assert_eq!(drained.status, ConditionStatus::False);
        assert_eq!(drained.reason, reasons::MACHINE_DRAIN_ERROR);
        assert_eq!(drained.severity, ConditionSeverity::Warning);
    }

    #[tokio::test]
    async fn nothing_to_do_outside_deletion_or_once_drained() {
        let mut client = MockDrainClient::new();
        client.expect_get_node().never();
        client.expect_patch_machine_status().never();
        let ctx = context(client);

        let mut live = deleting_machine("live", Some("node-a"));
        live.metadata.deletion_timestamp = None;
        reconcile(Arc::new(live), ctx.clone()).await.unwrap();

        let mut done = deleting_machine("done", Some("node-a"));
        conditions::mark(
            &mut done,
            Condition::new(conditions::MACHINE_DRAINED, ConditionStatus::True, "", "x"),
        );
        reconcile(Arc::new(done), ctx.clone()).await.unwrap();

        let mut paused = deleting_machine("paused", Some("node-a"));
        paused.status.as_mut().unwrap().authoritative_api = Some(AuthoritativeApi::ClusterApi);
        reconcile(Arc::new(paused), ctx).await.unwrap();
    }

    #[test]
    fn conflicts_requeue_quickly() {
        let ctx = context(MockDrainClient::new());
        let err = Error::Conflict {
            resource: "m".to_string(),
            message: "modified".to_string(),
        };
        let action = error_policy(Arc::new(deleting_machine("m", None)), &err, ctx);
        assert_eq!(action, Action::requeue(CONFLICT_REQUEUE));
    }
}
