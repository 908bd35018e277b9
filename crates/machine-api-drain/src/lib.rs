//! Node drain for deleting Machines
//!
//! Runs apart from the Machine reconciler so a wedged drain never holds up
//! other Machines. The two loops coordinate only through the `Drained`
//! condition on the Machine.

#![deny(missing_docs)]

pub mod controller;
pub mod drain;

pub use controller::{error_policy, reconcile, Context};
pub use drain::{drain_node, DrainClient, DrainOptions, DrainOutcome, KubeDrainClient};
