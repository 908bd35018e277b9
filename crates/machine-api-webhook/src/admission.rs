//! Admission handlers for Machines and MachineSets
//!
//! Mutation happens on create only: cluster-id labels, the authoritative
//! API and platform providerSpec defaults are filled in and returned as a
//! JSON patch. Validation runs on create and update and never consults
//! status. A request the webhook cannot parse is answered with an invalid
//! review instead of an HTTP error.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use kube::{
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use machine_api_common::crd::{AuthoritativeApi, Machine, MachineSet};
use machine_api_common::lifecycle_hooks::{describe, HookChanges};
use machine_api_common::{CLUSTER_ID_LABEL, MACHINE_API_NAMESPACE};

use crate::merge_patch;
use crate::policy::{ClusterInfo, FieldError, PolicyRegistry, SpecPolicy, SpecTarget, Verdict};
use crate::secrets::SecretLookup;
use crate::selector;

/// Defaulting webhook for Machines
pub const MUTATE_MACHINE_PATH: &str = "/mutate-machine-openshift-io-v1beta1-machine";
/// Validating webhook for Machines
pub const VALIDATE_MACHINE_PATH: &str = "/validate-machine-openshift-io-v1beta1-machine";
/// Defaulting webhook for MachineSets
pub const MUTATE_MACHINE_SET_PATH: &str = "/mutate-machine-openshift-io-v1beta1-machineset";
/// Validating webhook for MachineSets
pub const VALIDATE_MACHINE_SET_PATH: &str = "/validate-machine-openshift-io-v1beta1-machineset";

/// Shared state for the admission handlers
pub struct WebhookState {
    /// Cluster facts used for defaults
    pub cluster: ClusterInfo,
    /// Provider policies by platform
    pub policies: PolicyRegistry,
    /// Credentials Secret lookups
    pub secrets: Arc<dyn SecretLookup>,
}

impl WebhookState {
    /// State with every built-in provider policy
    pub fn new(cluster: ClusterInfo, secrets: Arc<dyn SecretLookup>) -> Self {
        Self {
            cluster,
            policies: PolicyRegistry::builtin(),
            secrets,
        }
    }

    fn policy(&self) -> Option<&dyn SpecPolicy> {
        self.policies.get(self.cluster.platform)
    }
}

/// Router serving all four admission endpoints plus `/healthz`
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_MACHINE_PATH, post(mutate_machine))
        .route(VALIDATE_MACHINE_PATH, post(validate_machine))
        .route(MUTATE_MACHINE_SET_PATH, post(mutate_machine_set))
        .route(VALIDATE_MACHINE_SET_PATH, post(validate_machine_set))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Machine,
    MachineSet,
}

impl Kind {
    fn provider_spec_path(self) -> &'static [&'static str] {
        match self {
            Kind::Machine => &["spec", "providerSpec"],
            Kind::MachineSet => &["spec", "template", "spec", "providerSpec"],
        }
    }
}

/// Default a Machine on create
pub async fn mutate_machine(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req = match parse(body) {
        Ok(req) => req,
        Err(response) => return Json(response.into_review()),
    };
    Json(mutate(&state, Kind::Machine, &req).into_review())
}

/// Default a MachineSet on create
pub async fn mutate_machine_set(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req = match parse(body) {
        Ok(req) => req,
        Err(response) => return Json(response.into_review()),
    };
    Json(mutate(&state, Kind::MachineSet, &req).into_review())
}

/// Validate a Machine on create and update
pub async fn validate_machine(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req = match parse(body) {
        Ok(req) => req,
        Err(response) => return Json(response.into_review()),
    };
    Json(validate(&state, Kind::Machine, &req).await.into_review())
}

/// Validate a MachineSet on create and update
pub async fn validate_machine_set(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req = match parse(body) {
        Ok(req) => req,
        Err(response) => return Json(response.into_review()),
    };
    Json(validate(&state, Kind::MachineSet, &req).await.into_review())
}

fn parse(
    body: AdmissionReview<DynamicObject>,
) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Err(AdmissionResponse::invalid(e.to_string()));
        }
    };
    Ok(req)
}

fn mutate(
    state: &WebhookState,
    kind: Kind,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    if !matches!(req.operation, Operation::Create) {
        return AdmissionResponse::from(req);
    }
    let Some(object) = &req.object else {
        debug!(uid = %req.uid, "No object in request, allowing unchanged");
        return AdmissionResponse::from(req);
    };

    let original = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::from(req).deny(format!("failed to encode object: {e}")),
    };
    let patch = match mutation_patch(state, kind, &original) {
        Ok(patch) => patch,
        Err(e) => {
            warn!(uid = %req.uid, name = %req.name, error = %e, "Rejecting undecodable providerSpec");
            return AdmissionResponse::from(req).deny(e.to_string());
        }
    };
    if patch.0.is_empty() {
        return AdmissionResponse::from(req);
    }

    info!(
        uid = %req.uid,
        kind = ?kind,
        name = %req.name,
        patch_ops = patch.0.len(),
        "Applying defaults"
    );
    match AdmissionResponse::from(req).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %req.uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(req).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// JSON patch that applies every create-time default to `original`
fn mutation_patch(
    state: &WebhookState,
    kind: Kind,
    original: &Value,
) -> Result<json_patch::Patch, FieldError> {
    let mut mutated = original.clone();
    apply_defaults(state, kind, &mut mutated)?;
    Ok(json_patch::diff(original, &mutated))
}

fn apply_defaults(state: &WebhookState, kind: Kind, object: &mut Value) -> Result<(), FieldError> {
    let cluster_id = state.cluster.cluster_id.as_str();
    if !cluster_id.is_empty() {
        set_default(object, &["metadata", "labels"], CLUSTER_ID_LABEL, cluster_id);
        if kind == Kind::MachineSet {
            set_default(
                object,
                &["spec", "template", "metadata", "labels"],
                CLUSTER_ID_LABEL,
                cluster_id,
            );
        }
    }
    set_default(
        object,
        &["spec"],
        "authoritativeAPI",
        &AuthoritativeApi::MachineApi.to_string(),
    );

    if let Some(policy) = state.policy() {
        let path = kind.provider_spec_path();
        let current = value_at(object, path).and_then(|p| p.get("value")).cloned();
        let defaulted = policy.default_value(current.as_ref(), &state.cluster)?;
        if let Some(provider_spec) = object_at(object, path) {
            provider_spec.insert("value".to_string(), defaulted);
        }
    }
    Ok(())
}

fn set_default(object: &mut Value, path: &[&str], key: &str, value: &str) {
    if let Some(map) = object_at(object, path) {
        map.entry(key.to_string())
            .or_insert_with(|| Value::String(value.to_string()));
    }
}

fn value_at<'a>(object: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(object, |current, key| current.get(*key))
}

/// Object at `path`, created along the way when missing or null
fn object_at<'a>(object: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    let mut current = object;
    for key in path {
        current = current
            .as_object_mut()?
            .entry(key.to_string())
            .or_insert(Value::Null);
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }
    current.as_object_mut()
}

async fn validate(
    state: &WebhookState,
    kind: Kind,
    req: &AdmissionRequest<DynamicObject>,
) -> AdmissionResponse {
    let Some(object) = &req.object else {
        return AdmissionResponse::from(req);
    };
    let new = match serde_json::to_value(object) {
        Ok(value) => value,
        Err(e) => return AdmissionResponse::from(req).deny(format!("failed to encode object: {e}")),
    };
    let old = match (&req.operation, &req.old_object) {
        (Operation::Update, Some(old)) => serde_json::to_value(old).ok(),
        _ => None,
    };

    if let Some(old) = &old {
        if kind == Kind::Machine
            && is_deleting(&new)
            && merge_patch::is_finalizer_only_removal(old, &new)
        {
            debug!(uid = %req.uid, name = %req.name, "Finalizer-only update, skipping validation");
            return AdmissionResponse::from(req);
        }
    }

    let namespace = req.namespace.as_deref().unwrap_or(MACHINE_API_NAMESPACE);
    let verdict = match kind {
        Kind::Machine => machine_verdict(state, new, old, namespace).await,
        Kind::MachineSet => machine_set_verdict(state, new, namespace).await,
    };
    if !verdict.is_allowed() {
        info!(uid = %req.uid, kind = ?kind, name = %req.name, reason = %verdict.message(), "Rejecting");
    }
    respond(AdmissionResponse::from(req), verdict)
}

fn is_deleting(object: &Value) -> bool {
    !object["metadata"]["deletionTimestamp"].is_null()
}

fn respond(response: AdmissionResponse, verdict: Verdict) -> AdmissionResponse {
    let mut response = if verdict.is_allowed() {
        response
    } else {
        response.deny(verdict.message())
    };
    if !verdict.warnings.is_empty() {
        response.warnings = Some(verdict.warnings);
    }
    response
}

async fn machine_verdict(
    state: &WebhookState,
    new: Value,
    old: Option<Value>,
    namespace: &str,
) -> Verdict {
    let mut verdict = Verdict::new();
    let machine: Machine = match serde_json::from_value(new) {
        Ok(machine) => machine,
        Err(e) => {
            verdict.error("object", format!("failed to decode Machine: {e}"));
            return verdict;
        }
    };

    if machine.is_deleting() {
        if let Some(old) = old.and_then(|old| serde_json::from_value::<Machine>(old).ok()) {
            frozen_hooks(&old, &machine, &mut verdict);
        }
    }

    let Some(policy) = state.policy() else {
        return verdict;
    };
    let name = object_name(&machine.metadata);
    let value = machine.spec.provider_spec.value.as_ref();
    verdict.merge(policy.validate_value(
        value,
        &SpecTarget {
            name: &name,
            cluster: &state.cluster,
        },
    ));
    check_credentials(state, policy, value, namespace, &mut verdict).await;
    verdict
}

/// Reject new or changed hooks on a Machine that is being deleted
fn frozen_hooks(old: &Machine, new: &Machine, verdict: &mut Verdict) {
    let changes = HookChanges::between(&old.spec.lifecycle_hooks, &new.spec.lifecycle_hooks);
    if !changes.pre_drain.is_empty() {
        verdict.error(
            "spec.lifecycleHooks.preDrain",
            format!(
                "Forbidden: pre-drain hooks are immutable when machine is marked for deletion: the following hooks are new or changed: {}",
                describe(&changes.pre_drain)
            ),
        );
    }
    if !changes.pre_terminate.is_empty() {
        verdict.error(
            "spec.lifecycleHooks.preTerminate",
            format!(
                "Forbidden: pre-terminate hooks are immutable when machine is marked for deletion: the following hooks are new or changed: {}",
                describe(&changes.pre_terminate)
            ),
        );
    }
}

async fn machine_set_verdict(state: &WebhookState, new: Value, namespace: &str) -> Verdict {
    let mut verdict = Verdict::new();
    let machine_set: MachineSet = match serde_json::from_value(new) {
        Ok(machine_set) => machine_set,
        Err(e) => {
            verdict.error("object", format!("failed to decode MachineSet: {e}"));
            return verdict;
        }
    };

    let template_labels = &machine_set.spec.template.metadata.labels;
    match selector::matches(&machine_set.spec.selector, template_labels) {
        Ok(true) => {}
        Ok(false) => verdict.error(
            "spec.template.metadata.labels",
            format!(
                "Invalid value: {template_labels:?}: `selector` does not match template `labels`"
            ),
        ),
        Err(message) => verdict.error("spec.selector", message),
    }

    let Some(policy) = state.policy() else {
        return verdict;
    };
    let name = object_name(&machine_set.metadata);
    let value = machine_set.spec.template.spec.provider_spec.value.as_ref();
    verdict.merge(policy.validate_value(
        value,
        &SpecTarget {
            name: &name,
            cluster: &state.cluster,
        },
    ));
    check_credentials(state, policy, value, namespace, &mut verdict).await;
    verdict
}

fn object_name(meta: &kube::api::ObjectMeta) -> String {
    meta.name
        .clone()
        .or_else(|| meta.generate_name.clone())
        .unwrap_or_default()
}

/// Warn, never reject, when the credentials Secret cannot be found
async fn check_credentials(
    state: &WebhookState,
    policy: &dyn SpecPolicy,
    value: Option<&Value>,
    namespace: &str,
    verdict: &mut Verdict,
) {
    let Some(secret) = policy.credentials_secret(value) else {
        return;
    };
    let namespace = if secret.namespace.is_empty() {
        namespace
    } else {
        secret.namespace.as_str()
    };
    match state.secrets.exists(namespace, &secret.name).await {
        Ok(true) => {}
        Ok(false) => verdict.warn(format!(
            "providerSpec.credentialsSecret: Invalid value: \"{}\": not found. Expected CredentialsSecret to exist",
            secret.name
        )),
        Err(e) => {
            warn!(secret = %secret.name, namespace = %namespace, error = %e, "Failed to look up credentials secret");
            verdict.warn(format!(
                "providerSpec.credentialsSecret: Invalid value: \"{}\": could not be checked: {e}",
                secret.name
            ));
        }
    }
}
