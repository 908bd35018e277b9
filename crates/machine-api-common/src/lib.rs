//! Common types for the Machine API controllers: CRDs, conditions,
//! lifecycle hooks, errors, and shared controller plumbing

#![deny(missing_docs)]

pub mod backoff;
pub mod conditions;
pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod lifecycle_hooks;
pub mod platform;
pub mod retry;
pub mod telemetry;

pub use error::Error;
pub use platform::Platform;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group served by the Machine and MachineSet CRDs
pub const MACHINE_API_GROUP: &str = "machine.openshift.io";

/// Namespace the controllers and their secrets live in by default
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

/// Finalizer held on every Machine until its instance is confirmed gone
pub const MACHINE_FINALIZER: &str = "machine.machine.openshift.io";

/// Label carrying the cluster's infrastructure name, set at admission
pub const CLUSTER_ID_LABEL: &str = "machine.openshift.io/cluster-api-cluster";

/// Machine annotation that exempts the backing node from draining
pub const EXCLUDE_NODE_DRAINING_ANNOTATION: &str = "machine.openshift.io/exclude-node-draining";

/// Machine annotation recording provider-side instance state
pub const INSTANCE_STATE_ANNOTATION: &str = "machine.openshift.io/instance-state";

/// Value of [`INSTANCE_STATE_ANNOTATION`] once the instance state is ambiguous
pub const UNKNOWN_INSTANCE_STATE: &str = "unknown";

/// Node annotation pointing back at the linked Machine (`namespace/name`)
pub const MACHINE_ANNOTATION: &str = "machine.openshift.io/machine";
