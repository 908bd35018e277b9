//! Admission webhooks for Machines and MachineSets
//!
//! Mutating handlers default the cluster-id label, the authoritative API
//! and per-platform providerSpec fields on create. Validating handlers run
//! the platform's providerSpec rules, keep lifecycle hooks frozen once a
//! Machine is being deleted, and check MachineSet selectors. Everything is
//! served from one axum router; the operator binary adds TLS.

#![deny(missing_docs)]

pub mod admission;
pub mod merge_patch;
pub mod policy;
pub mod providers;
pub mod secrets;
pub mod selector;

pub use admission::{router, WebhookState};
pub use policy::{ClusterInfo, FieldError, PolicyRegistry, ProviderPolicy, Verdict};
pub use secrets::{KubeSecretLookup, SecretLookup};
