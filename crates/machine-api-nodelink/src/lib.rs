//! Node linker
//!
//! Matches Nodes to Machines by provider ID or InternalIP, records the link
//! in `machine.status.nodeRef`, and propagates the Machine's declared taints
//! and labels onto the Node without ever removing or overriding what the
//! Node already carries.

#![deny(missing_docs)]

pub mod controller;
pub mod index;
pub mod merge;

pub use controller::{error_policy, reconcile, watch_machines, Context, NodeLinkClient};
pub use index::MachineIndex;
