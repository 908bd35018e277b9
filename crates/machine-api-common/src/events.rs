//! Kubernetes Event recording for the Machine API controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit Events visible via `kubectl describe`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "DrainBlocked")
    /// * `action` - What action was taken (e.g. "Drain")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "machine-drain-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and dry runs.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    // Machine lifecycle
    /// The actuator created the instance
    pub const CREATE: &str = "Create";
    /// The actuator updated the instance
    pub const UPDATE: &str = "Update";
    /// The actuator failed to create the instance
    pub const FAILED_CREATE: &str = "FailedCreate";
    /// The actuator failed to update the instance
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    /// The actuator deleted the instance
    pub const DELETE: &str = "Delete";
    /// The actuator failed to delete the instance
    pub const FAILED_DELETE: &str = "FailedDelete";
    /// The Machine entered the Failed phase
    pub const MACHINE_FAILED: &str = "MachineFailed";

    // Drain
    /// A pre-drain hook blocks draining
    pub const DRAIN_BLOCKED: &str = "DrainBlocked";
    /// Draining has started
    pub const DRAIN_PROCEEDS: &str = "DrainProceeds";
    /// Draining finished
    pub const DRAIN_SUCCEEDED: &str = "DrainSucceeded";
    /// Draining timed out and will be retried
    pub const DRAIN_REQUEUED: &str = "DrainRequeued";
    /// Draining failed
    pub const DRAIN_FAILED: &str = "DrainFailed";

    // Node linking
    /// A node was linked to the Machine
    pub const LINKED: &str = "Linked";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating an instance
    pub const CREATE: &str = "Create";
    /// Updating an instance
    pub const UPDATE: &str = "Update";
    /// Deleting an instance
    pub const DELETE: &str = "Delete";
    /// Draining a node
    pub const DRAIN: &str = "Drain";
    /// Linking a node to its Machine
    pub const LINK: &str = "Link";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::DRAIN_BLOCKED, "DrainBlocked");
        assert_eq!(reasons::DRAIN_SUCCEEDED, "DrainSucceeded");
        assert_eq!(reasons::FAILED_CREATE, "FailedCreate");
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::DRAIN_SUCCEEDED,
                actions::DRAIN,
                Some("test".to_string()),
            )
            .await;
    }

    #[tokio::test]
    async fn mock_publisher_records_reason() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, type_, reason, action, _| {
                *type_ == EventType::Warning
                    && reason == reasons::DRAIN_BLOCKED
                    && action == actions::DRAIN
            })
            .times(1)
            .return_const(());
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Warning,
                reasons::DRAIN_BLOCKED,
                actions::DRAIN,
                None,
            )
            .await;
    }
}
