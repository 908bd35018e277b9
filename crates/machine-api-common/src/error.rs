//! Error types for the Machine API controllers
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the object it concerns and a description of
//! what failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Machine API operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// Optimistic concurrency conflict on write (HTTP 409)
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Object that lost the write race
        resource: String,
        /// Message returned by the API server
        message: String,
    },

    /// Validation error for a Machine or MachineSet spec
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.providerSpec.value.ami")
        field: Option<String>,
    },

    /// Provider actuator error surfaced through the reconciler
    #[error("provider error for {machine}: {message}")]
    Provider {
        /// Machine the actuator was acting on
        machine: String,
        /// Description of what failed
        message: String,
        /// Whether the reconciler should retry
        retryable: bool,
    },

    /// Node drain error
    #[error("drain error for node {node}: {message}")]
    Drain {
        /// Node being drained
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "webhook", "leader-election")
        context: String,
    },
}

impl From<kube::Error> for Error {
    fn from(source: kube::Error) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: UNKNOWN_CONTEXT.to_string(),
                message: ae.message,
            },
            source => Self::Kube { source },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with object context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error for a machine
    pub fn provider_for(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            machine: machine.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., invalid configuration)
    pub fn provider_permanent(machine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            machine: machine.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a drain error for a node
    pub fn drain(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Drain {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach the name of the object to a conflict error
    pub fn for_resource(self, name: impl Into<String>) -> Self {
        match self {
            Self::Conflict { message, .. } => Self::Conflict {
                resource: name.into(),
                message,
            },
            other => other,
        }
    }

    /// True for optimistic-concurrency conflicts, which are retried quietly
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when the API server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need a spec fix.
    /// Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429
            ),
            Error::Conflict { .. } => true,
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Drain { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: two writers race on the same Machine and the loser retries quietly
    #[test]
    fn story_conflicting_writes_become_conflict_errors() {
        let err = Error::from(api_error(409)).for_resource("openshift-machine-api/worker-a");
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("worker-a"));
    }

    #[test]
    fn not_found_is_detected_and_not_retried() {
        let err = Error::from(api_error(404));
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert!(Error::from(api_error(429)).is_retryable());
        assert!(Error::from(api_error(500)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
    }

    /// Story: an actuator reporting bad configuration must not be retried
    #[test]
    fn story_permanent_provider_errors_stop_retries() {
        let err = Error::provider_permanent("worker-b", "unknown instance type");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("worker-b"));

        let err = Error::provider_for("worker-b", "rate limited");
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_errors_carry_field_paths() {
        let err = Error::validation_for_field("ms-1", "spec.selector", "does not match");
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.selector")),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err = Error::from(parse.unwrap_err());
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn for_resource_leaves_other_variants_alone() {
        let err = Error::drain("node-1", "eviction failed").for_resource("x");
        assert!(err.to_string().contains("node-1"));
        assert!(err.is_retryable());
    }
}
