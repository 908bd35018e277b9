//! Machine controller implementation
//!
//! Each pass observes the Machine, asks the actuator whether its instance
//! exists, and advances the phase: Provisioning, Provisioned, Running, or
//! Failed. Deletion walks pre-drain hooks, the drain result published by the
//! drain controller, pre-terminate hooks, instance deletion, node cleanup,
//! and finally finalizer removal. All progress lives on the object so a
//! restarted controller picks up where the last one stopped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use machine_api_common::backoff::ErrorBackoff;
use machine_api_common::conditions::{self, reasons};
use machine_api_common::crd::{
    Condition, ConditionSeverity, ConditionStatus, LastOperation, Machine, MachinePhase,
};
use machine_api_common::events::{
    actions, reasons as event_reasons, EventPublisher, KubeEventPublisher,
};
use machine_api_common::lifecycle_hooks::describe;
use machine_api_common::{
    Error, INSTANCE_STATE_ANNOTATION, MACHINE_FINALIZER, UNKNOWN_INSTANCE_STATE,
};

use crate::actuator::{Actuator, ActuatorError};

/// Requeue interval while waiting for a created instance to report in
pub const REQUEUE_AFTER: Duration = Duration::from_secs(20);

/// How often a Failed Machine with a live instance checks whether it is gone
pub const FAILED_INSTANCE_RECHECK: Duration = Duration::from_secs(300);

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
const FIELD_MANAGER: &str = "machine-controller";
const INVALID_CONFIGURATION_REASON: &str = "InvalidConfiguration";
const INSTANCE_MISSING_MESSAGE: &str = "Can't find created instance.";

const OPERATION_CREATE: &str = "Create";
const OPERATION_UPDATE: &str = "Update";
const OPERATION_DELETE: &str = "Delete";
const OPERATION_SUCCEEDED: &str = "Successful";
const OPERATION_FAILED: &str = "Failed";

/// Kubernetes operations the Machine controller performs
///
/// Lets tests drive the reconciler with mocks while production uses
/// [`MachineClientImpl`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineClient: Send + Sync {
    /// Write spec, labels and annotations
    ///
    /// The write carries the Machine's resourceVersion, so a stale copy
    /// fails with a conflict. Returns the stored object.
    async fn patch_machine(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Write the status subresource, guarded by resourceVersion
    async fn patch_status(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Add the controller finalizer
    async fn add_finalizer(&self, machine: &Machine) -> Result<(), Error>;

    /// Remove the controller finalizer, letting the API server reap the object
    async fn remove_finalizer(&self, machine: &Machine) -> Result<(), Error>;

    /// Delete a Node; a missing Node is not an error
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// Production [`MachineClient`] backed by the API server
pub struct MachineClientImpl {
    client: Client,
}

impl MachineClientImpl {
    /// Create a client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, machine: &Machine) -> Api<Machine> {
        Api::namespaced(self.client.clone(), &machine.namespace().unwrap_or_default())
    }

    async fn patch_finalizers(&self, machine: &Machine, finalizers: Vec<String>) -> Result<(), Error> {
        let patch = json!({
            "metadata": {
                "resourceVersion": machine.resource_version(),
                "finalizers": finalizers
            }
        });
        self.api(machine)
            .patch(
                &machine.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::from(e).for_resource(machine.key()))?;
        Ok(())
    }
}

#[async_trait]
impl MachineClient for MachineClientImpl {
    async fn patch_machine(&self, machine: &Machine) -> Result<Machine, Error> {
        let patch = json!({
            "metadata": {
                "resourceVersion": machine.resource_version(),
                "labels": machine.metadata.labels,
                "annotations": machine.metadata.annotations
            },
            "spec": machine.spec
        });
        self.api(machine)
            .patch(
                &machine.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::from(e).for_resource(machine.key()))
    }

    async fn patch_status(&self, machine: &Machine) -> Result<Machine, Error> {
        let patch = json!({
            "metadata": { "resourceVersion": machine.resource_version() },
            "status": machine.status
        });
        self.api(machine)
            .patch_status(
                &machine.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::from(e).for_resource(machine.key()))
    }

    async fn add_finalizer(&self, machine: &Machine) -> Result<(), Error> {
        let mut finalizers = machine.finalizers().to_vec();
        if finalizers.iter().any(|f| f == MACHINE_FINALIZER) {
            return Ok(());
        }
        finalizers.push(MACHINE_FINALIZER.to_string());
        self.patch_finalizers(machine, finalizers).await
    }

    async fn remove_finalizer(&self, machine: &Machine) -> Result<(), Error> {
        let finalizers: Vec<String> = machine
            .finalizers()
            .iter()
            .filter(|f| *f != MACHINE_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(machine, finalizers).await
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared state for the Machine controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, actuator).build();
/// ```
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn MachineClient>,
    /// Provider actuator
    pub actuator: Arc<dyn Actuator>,
    /// Event sink for operator-visible progress
    pub events: Arc<dyn EventPublisher>,
    /// Per-Machine error backoff consulted by [`error_policy`]
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, actuator: Arc<dyn Actuator>) -> ContextBuilder {
        ContextBuilder::new(client, actuator)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn MachineClient>,
        actuator: Arc<dyn Actuator>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            actuator,
            events,
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    actuator: Arc<dyn Actuator>,
    kube: Option<Arc<dyn MachineClient>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, actuator: Arc<dyn Actuator>) -> Self {
        Self {
            client,
            actuator,
            kube: None,
            events: None,
        }
    }

    /// Override the Kubernetes operations (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn MachineClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(MachineClientImpl::new(self.client.clone()))),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), "machine-controller"))
            }),
            actuator: self.actuator,
            backoff: ErrorBackoff::default(),
        }
    }
}

/// Reconcile a Machine
///
/// Returns the requeue action for the work queue, or an error for the
/// [`error_policy`] to back off on. Actuator requeue requests are turned
/// into a scheduled requeue here and never surface as errors.
#[instrument(skip(machine, ctx), fields(machine = %machine.key()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let result = reconcile_machine(&machine, &ctx).await;
    if result.is_ok() {
        ctx.backoff.reset(&machine.key());
    }
    result
}

async fn reconcile_machine(original: &Machine, ctx: &Context) -> Result<Action, Error> {
    let mut machine = original.clone();
    debug!(phase = ?machine.phase(), "reconciling machine");

    if machine.is_paused() {
        let api = machine.authoritative_api().unwrap_or_default();
        conditions::mark(
            &mut machine,
            Condition::new(
                conditions::PAUSED,
                ConditionStatus::True,
                reasons::AUTHORITATIVE_API_NOT_MACHINE_API,
                format!("The AuthoritativeAPI is set to {api}"),
            ),
        );
        persist(original, &mut machine, ctx).await?;
        info!(authoritative_api = %api, "machine is paused, skipping reconciliation");
        return Ok(Action::await_change());
    }

    conditions::mark(
        &mut machine,
        conditions::false_condition(
            conditions::PAUSED,
            reasons::AUTHORITATIVE_API_MACHINE_API,
            ConditionSeverity::Info,
            "The AuthoritativeAPI is set to MachineAPI",
        ),
    );

    if machine.is_deleting() {
        return handle_deletion(original, machine, ctx).await;
    }

    if !machine.has_finalizer() {
        persist(original, &mut machine, ctx).await?;
        ctx.kube.add_finalizer(&machine).await?;
        info!("added finalizer");
        return Ok(Action::await_change());
    }

    if machine.is_failed() {
        persist(original, &mut machine, ctx).await?;
        debug!("machine is in Failed phase, not reconciling the instance");
        return Ok(Action::await_change());
    }

    let exists = match ctx.actuator.exists(&machine).await {
        Ok(exists) => exists,
        Err(e) => {
            if let Some(delay) = e.requeue_after() {
                return Ok(Action::requeue(delay));
            }
            conditions::mark(
                &mut machine,
                Condition::new(
                    conditions::INSTANCE_EXISTS,
                    ConditionStatus::Unknown,
                    reasons::ERROR_CHECKING_PROVIDER,
                    e.to_string(),
                ),
            );
            persist(original, &mut machine, ctx).await?;
            return Err(e.into_error(&machine.key()));
        }
    };

    if exists {
        return reconcile_existing(original, machine, ctx).await;
    }

    if machine.is_provisioned() {
        warn!(provider_id = ?machine.provider_id(), "instance is gone, marking machine failed");
        conditions::mark(
            &mut machine,
            conditions::false_condition(
                conditions::INSTANCE_EXISTS,
                reasons::INSTANCE_MISSING,
                ConditionSeverity::Warning,
                "Instance not found on provider",
            ),
        );
        mark_failed(&mut machine, None, INSTANCE_MISSING_MESSAGE);
        persist(original, &mut machine, ctx).await?;
        publish(
            ctx,
            &machine,
            EventType::Warning,
            event_reasons::MACHINE_FAILED,
            actions::RECONCILE,
            INSTANCE_MISSING_MESSAGE.to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    if machine.phase().is_none() {
        conditions::mark(
            &mut machine,
            conditions::false_condition(
                conditions::INSTANCE_EXISTS,
                reasons::INSTANCE_NOT_CREATED,
                ConditionSeverity::Info,
                "Instance has not been created",
            ),
        );
        set_phase(&mut machine, MachinePhase::Provisioning);
        persist(original, &mut machine, ctx).await?;
        info!("machine is provisioning");
        return Ok(Action::await_change());
    }

    create_instance(original, machine, ctx).await
}

async fn reconcile_existing(
    original: &Machine,
    mut machine: Machine,
    ctx: &Context,
) -> Result<Action, Error> {
    conditions::mark(&mut machine, conditions::true_condition(conditions::INSTANCE_EXISTS));

    if let Err(e) = ctx.actuator.update(&mut machine).await {
        return handle_actuator_failure(original, machine, ctx, e, OPERATION_UPDATE).await;
    }
    record_operation(&mut machine, OPERATION_UPDATE, OPERATION_SUCCEEDED);

    if !machine.is_provisioned() {
        persist(original, &mut machine, ctx).await?;
        debug!("instance exists but has no provider ID or addresses yet");
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    if !machine.has_node() {
        set_phase(&mut machine, MachinePhase::Provisioned);
        persist(original, &mut machine, ctx).await?;
        debug!("instance provisioned, waiting for its node");
        return Ok(Action::requeue(REQUEUE_AFTER));
    }

    set_phase(&mut machine, MachinePhase::Running);
    persist(original, &mut machine, ctx).await?;
    Ok(Action::await_change())
}

async fn create_instance(
    original: &Machine,
    mut machine: Machine,
    ctx: &Context,
) -> Result<Action, Error> {
    info!("creating instance");
    if let Err(e) = ctx.actuator.create(&mut machine).await {
        return handle_actuator_failure(original, machine, ctx, e, OPERATION_CREATE).await;
    }

    conditions::mark(
        &mut machine,
        Condition::new(
            conditions::MACHINE_CREATED,
            ConditionStatus::True,
            reasons::MACHINE_CREATION_SUCCEEDED,
            "",
        ),
    );
    record_operation(&mut machine, OPERATION_CREATE, OPERATION_SUCCEEDED);
    persist(original, &mut machine, ctx).await?;
    publish(
        ctx,
        &machine,
        EventType::Normal,
        event_reasons::CREATE,
        actions::CREATE,
        format!("Created Machine {}", machine.name_any()),
    )
    .await;
    Ok(Action::requeue(REQUEUE_AFTER))
}

/// Classify a Create or Update failure
///
/// Invalid configuration fails the Machine for good; a requeue request is
/// honored quietly; anything else is recorded and returned for backoff.
async fn handle_actuator_failure(
    original: &Machine,
    mut machine: Machine,
    ctx: &Context,
    err: ActuatorError,
    operation: &str,
) -> Result<Action, Error> {
    if let Some(delay) = err.requeue_after() {
        persist(original, &mut machine, ctx).await?;
        debug!(operation, delay_secs = delay.as_secs(), "actuator requested requeue");
        return Ok(Action::requeue(delay));
    }

    let creating = operation == OPERATION_CREATE;
    let (event_reason, event_action) = if creating {
        (event_reasons::FAILED_CREATE, actions::CREATE)
    } else {
        (event_reasons::FAILED_UPDATE, actions::UPDATE)
    };

    if err.is_invalid_configuration() {
        warn!(operation, error = %err, "invalid machine configuration");
        if creating {
            conditions::mark(
                &mut machine,
                conditions::false_condition(
                    conditions::MACHINE_CREATED,
                    reasons::MACHINE_CREATION_FAILED,
                    ConditionSeverity::Error,
                    err.to_string(),
                ),
            );
        }
        record_operation(&mut machine, operation, OPERATION_FAILED);
        mark_failed(&mut machine, Some(INVALID_CONFIGURATION_REASON), err.to_string());
        persist(original, &mut machine, ctx).await?;
        publish(ctx, &machine, EventType::Warning, event_reason, event_action, err.to_string())
            .await;
        return Ok(Action::await_change());
    }

    if creating {
        conditions::mark(
            &mut machine,
            conditions::false_condition(
                conditions::MACHINE_CREATED,
                reasons::MACHINE_CREATION_FAILED,
                ConditionSeverity::Warning,
                err.to_string(),
            ),
        );
    }
    record_operation(&mut machine, operation, OPERATION_FAILED);
    persist(original, &mut machine, ctx).await?;
    publish(ctx, &machine, EventType::Warning, event_reason, event_action, err.to_string()).await;
    Err(err.into_error(&machine.key()))
}

/// Walk the deletion sequence
///
/// Pre-drain hooks, drain completion and pre-terminate hooks each block
/// the next stage. The finalizer only goes once the instance is gone.
async fn handle_deletion(
    original: &Machine,
    mut machine: Machine,
    ctx: &Context,
) -> Result<Action, Error> {
    if !machine.has_finalizer() {
        debug!("deleting machine has no finalizer, nothing to do");
        return Ok(Action::await_change());
    }

    if !machine.is_failed() {
        set_phase(&mut machine, MachinePhase::Deleting);
    }

    let hooks = machine.spec.lifecycle_hooks.clone();
    if !hooks.pre_drain.is_empty() {
        conditions::mark(
            &mut machine,
            conditions::false_condition(
                conditions::DRAINABLE,
                reasons::HOOK_PRESENT,
                ConditionSeverity::Warning,
                format!(
                    "Drain operation currently blocked by: {}",
                    describe(&hooks.pre_drain)
                ),
            ),
        );
        persist(original, &mut machine, ctx).await?;
        info!(hooks = %describe(&hooks.pre_drain), "deletion blocked by pre-drain hooks");
        return Ok(Action::await_change());
    }
    conditions::mark(&mut machine, conditions::true_condition(conditions::DRAINABLE));

    if !conditions::is_true(&machine, conditions::MACHINE_DRAINED) {
        persist(original, &mut machine, ctx).await?;
        debug!("waiting for node drain");
        return Ok(Action::await_change());
    }

    if !hooks.pre_terminate.is_empty() {
        conditions::mark(
            &mut machine,
            conditions::false_condition(
                conditions::TERMINABLE,
                reasons::HOOK_PRESENT,
                ConditionSeverity::Warning,
                format!(
                    "Terminate operation currently blocked by: {}",
                    describe(&hooks.pre_terminate)
                ),
            ),
        );
        persist(original, &mut machine, ctx).await?;
        info!(hooks = %describe(&hooks.pre_terminate), "deletion blocked by pre-terminate hooks");
        return Ok(Action::await_change());
    }
    conditions::mark(&mut machine, conditions::true_condition(conditions::TERMINABLE));

    let pending = if machine.is_failed() && machine.provider_id().is_some() {
        hold_failed_instance(original, &mut machine, ctx).await?
    } else {
        delete_instance(original, &mut machine, ctx).await?
    };
    if let Some(action) = pending {
        return Ok(action);
    }

    if let Some(node) = machine.node_name() {
        info!(node, "deleting node");
        ctx.kube.delete_node(node).await?;
    }

    persist(original, &mut machine, ctx).await?;
    ctx.kube.remove_finalizer(&machine).await?;
    info!("removed finalizer");
    Ok(Action::await_change())
}

/// Check on the instance of a Failed Machine without deleting it
///
/// A Failed Machine gets no provider Create or Delete. The finalizer stays
/// while the provider still reports the instance; an operator has to remove
/// it first. Returns `None` once the instance is confirmed gone.
async fn hold_failed_instance(
    original: &Machine,
    machine: &mut Machine,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let key = machine.key();
    let exists = match ctx.actuator.exists(machine).await {
        Ok(exists) => exists,
        Err(e) => {
            persist(original, machine, ctx).await?;
            if let Some(delay) = e.requeue_after() {
                return Ok(Some(Action::requeue(delay)));
            }
            return Err(e.into_error(&key));
        }
    };

    if !exists {
        conditions::mark(
            machine,
            conditions::false_condition(
                conditions::INSTANCE_EXISTS,
                reasons::INSTANCE_MISSING,
                ConditionSeverity::Info,
                "Instance not found on provider",
            ),
        );
        debug!("failed machine has no instance left, releasing it");
        return Ok(None);
    }

    let provider_id = machine.provider_id().unwrap_or_default().to_string();
    let message = format!(
        "Machine failed while instance {provider_id} still exists; delete the instance to release the Machine"
    );
    conditions::mark(machine, conditions::true_condition(conditions::INSTANCE_EXISTS));
    conditions::mark(
        machine,
        conditions::false_condition(
            conditions::TERMINABLE,
            reasons::FAILED_INSTANCE_PRESENT,
            ConditionSeverity::Warning,
            message.clone(),
        ),
    );
    persist(original, machine, ctx).await?;
    warn!(%provider_id, "failed machine still has an instance, keeping finalizer");
    publish(
        ctx,
        machine,
        EventType::Warning,
        event_reasons::FAILED_DELETE,
        actions::DELETE,
        message,
    )
    .await;
    Ok(Some(Action::requeue(FAILED_INSTANCE_RECHECK)))
}

/// Delete the instance if it exists
///
/// Returns an action when deletion has to wait, `None` once the instance
/// is confirmed gone.
async fn delete_instance(
    original: &Machine,
    machine: &mut Machine,
    ctx: &Context,
) -> Result<Option<Action>, Error> {
    let key = machine.key();
    let exists = match ctx.actuator.exists(machine).await {
        Ok(exists) => exists,
        Err(e) => {
            if let Some(delay) = e.requeue_after() {
                persist(original, machine, ctx).await?;
                return Ok(Some(Action::requeue(delay)));
            }
            persist(original, machine, ctx).await?;
            return Err(e.into_error(&key));
        }
    };

    if !exists {
        debug!("instance does not exist, skipping provider delete");
        return Ok(None);
    }

    info!("deleting instance");
    match ctx.actuator.delete(machine).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => debug!("instance already gone"),
        Err(e) => {
            if let Some(delay) = e.requeue_after() {
                persist(original, machine, ctx).await?;
                return Ok(Some(Action::requeue(delay)));
            }
            record_operation(machine, OPERATION_DELETE, OPERATION_FAILED);
            persist(original, machine, ctx).await?;
            publish(
                ctx,
                machine,
                EventType::Warning,
                event_reasons::FAILED_DELETE,
                actions::DELETE,
                e.to_string(),
            )
            .await;
            return Err(e.into_error(&key));
        }
    }
    record_operation(machine, OPERATION_DELETE, OPERATION_SUCCEEDED);
    publish(
        ctx,
        machine,
        EventType::Normal,
        event_reasons::DELETE,
        actions::DELETE,
        format!("Deleted machine {}", machine.name_any()),
    )
    .await;

    let still_there = match ctx.actuator.exists(machine).await {
        Ok(exists) => exists,
        Err(e) => {
            persist(original, machine, ctx).await?;
            return Err(e.into_error(&key));
        }
    };
    if still_there {
        persist(original, machine, ctx).await?;
        info!("instance still present after delete, waiting");
        return Ok(Some(Action::requeue(REQUEUE_AFTER)));
    }
    Ok(None)
}

/// Write whatever changed since `original` was read
///
/// Spec and metadata go first so their new resourceVersion guards the
/// status write. The status is written only when its content differs;
/// `lastUpdated` moves only on such a write.
async fn persist(original: &Machine, machine: &mut Machine, ctx: &Context) -> Result<(), Error> {
    if machine.spec != original.spec
        || machine.metadata.labels != original.metadata.labels
        || machine.metadata.annotations != original.metadata.annotations
    {
        let stored = ctx.kube.patch_machine(machine).await?;
        machine.metadata.resource_version = stored.metadata.resource_version;
    }

    let previous = original.status.clone().unwrap_or_default();
    let status = machine.status.get_or_insert_with(Default::default);
    conditions::merge_from(&mut status.conditions, &previous.conditions);
    if !status.content_differs(&previous) {
        debug!("status unchanged, skipping write");
        return Ok(());
    }
    status.last_updated = Some(Utc::now());

    let stored = ctx.kube.patch_status(machine).await?;
    machine.metadata.resource_version = stored.metadata.resource_version;
    Ok(())
}

fn set_phase(machine: &mut Machine, phase: MachinePhase) {
    let status = machine.status.get_or_insert_with(Default::default);
    if status.phase != Some(phase) {
        info!(from = ?status.phase, to = %phase, "phase transition");
        status.phase = Some(phase);
    }
}

/// Move the Machine to Failed and flag the instance state as unknown
///
/// `instanceState` and `vmState` in the provider status are rewritten to
/// `Unknown`; a `state` key is left as the provider wrote it.
fn mark_failed(machine: &mut Machine, reason: Option<&str>, message: impl Into<String>) {
    set_phase(machine, MachinePhase::Failed);
    let status = machine.status.get_or_insert_with(Default::default);
    status.error_message = Some(message.into());
    if let Some(reason) = reason {
        status.error_reason = Some(reason.to_string());
    }
    if let Some(serde_json::Value::Object(fields)) = status.provider_status.as_mut() {
        for key in ["instanceState", "vmState"] {
            if let Some(value) = fields.get_mut(key) {
                *value = json!("Unknown");
            }
        }
    }
    machine.annotations_mut().insert(
        INSTANCE_STATE_ANNOTATION.to_string(),
        UNKNOWN_INSTANCE_STATE.to_string(),
    );
}

fn record_operation(machine: &mut Machine, operation: &str, state: &str) {
    let description = match state {
        OPERATION_SUCCEEDED => format!("{operation} of machine {} succeeded", machine.name_any()),
        _ => format!("{operation} of machine {} failed", machine.name_any()),
    };
    machine.status.get_or_insert_with(Default::default).last_operation = Some(LastOperation {
        description: Some(description),
        last_updated: Some(Utc::now()),
        state: Some(state.to_string()),
        type_: Some(operation.to_string()),
    });
}

async fn publish(
    ctx: &Context,
    machine: &Machine,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&machine.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Error policy for the Machine controller
///
/// Conflicts mean another writer got there first; retry promptly against
/// the fresh object. Everything else backs off exponentially per Machine.
pub fn error_policy(machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = machine.key();
    if error.is_conflict() {
        debug!(machine = %key, "write conflict, requeueing");
        return Action::requeue(CONFLICT_REQUEUE);
    }
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        machine = %key,
        retry_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
