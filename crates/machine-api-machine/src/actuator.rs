//! Provider actuator contract
//!
//! An actuator materializes a Machine as a real cloud or virtualization
//! instance. The reconciler only ever talks to the provider through this
//! trait; the per-cloud implementations live in provider binaries.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use machine_api_common::crd::Machine;
use machine_api_common::Error;

#[cfg(test)]
use mockall::automock;

/// Errors an actuator may return
///
/// Classification walks through [`ActuatorError::Context`] wrappers, so an
/// actuator can add detail without hiding the kind from the reconciler.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// The providerSpec can never produce an instance; the Machine fails
    #[error("invalid machine configuration: {0}")]
    InvalidMachineConfiguration(String),

    /// Instance creation failed and will be retried
    #[error("failed to create machine: {0}")]
    CreateMachine(String),

    /// Instance update failed and will be retried
    #[error("failed to update machine: {0}")]
    UpdateMachine(String),

    /// Instance deletion failed and will be retried
    #[error("failed to delete machine: {0}")]
    DeleteMachine(String),

    /// Not an error: check back after the given duration
    #[error("requeue in {0:?}")]
    RequeueAfter(Duration),

    /// The instance does not exist at the provider
    #[error("instance not found: {0}")]
    NotFound(String),

    /// Another error with added context
    #[error("{message}: {source}")]
    Context {
        /// What the actuator was doing
        message: String,
        /// The wrapped error
        #[source]
        source: Box<ActuatorError>,
    },
}

impl ActuatorError {
    /// Wrap this error with a description of what was being attempted
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, past any context wrappers
    pub fn root(&self) -> &ActuatorError {
        let mut current = self;
        while let Self::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// True when retrying can never succeed
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self.root(), Self::InvalidMachineConfiguration(_))
    }

    /// Delay requested by the actuator, if this is a requeue signal
    pub fn requeue_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RequeueAfter(d) => Some(*d),
            _ => None,
        }
    }

    /// True when the instance is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound(_))
    }

    /// Convert into the controller error for `machine`
    pub fn into_error(self, machine: &str) -> Error {
        if self.is_invalid_configuration() {
            Error::provider_permanent(machine, self.to_string())
        } else {
            Error::provider_for(machine, self.to_string())
        }
    }
}

/// Provider contract invoked by the Machine reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Whether the instance backing the Machine exists; no side effects
    async fn exists(&self, machine: &Machine) -> Result<bool, ActuatorError>;

    /// Create the instance
    ///
    /// Must be idempotent until `exists` reports true. Should record the
    /// provider ID and addresses on the Machine before returning.
    async fn create(&self, machine: &mut Machine) -> Result<(), ActuatorError>;

    /// Reconcile provider-side state of an existing instance
    async fn update(&self, machine: &mut Machine) -> Result<(), ActuatorError>;

    /// Delete the instance; `NotFound` also means gone
    async fn delete(&self, machine: &Machine) -> Result<(), ActuatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_sees_through_context() {
        let err = ActuatorError::InvalidMachineConfiguration("no ami".into())
            .context("building instance request")
            .context("reconciling worker-0");
        assert!(err.is_invalid_configuration());
        assert!(err.to_string().contains("no ami"));

        let err = ActuatorError::RequeueAfter(Duration::from_secs(30)).context("waiting for IP");
        assert_eq!(err.requeue_after(), Some(Duration::from_secs(30)));
        assert!(!err.is_invalid_configuration());

        assert!(ActuatorError::NotFound("i-1".into())
            .context("terminate")
            .is_not_found());
    }

    #[test]
    fn transient_errors_convert_to_retryable_provider_errors() {
        let err = ActuatorError::CreateMachine("throttled".into()).into_error("ns/m");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ns/m"));

        let err = ActuatorError::InvalidMachineConfiguration("bad".into()).into_error("ns/m");
        assert!(!err.is_retryable());
    }
}
