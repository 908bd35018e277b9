//! Machine phase reconciler
//!
//! Drives a Machine through Provisioning, Provisioned and Running by
//! calling a provider [`Actuator`], holds the controller finalizer until
//! the instance is confirmed gone, and reports progress as conditions.

#![deny(missing_docs)]

pub mod actuator;
pub mod controller;

pub use actuator::{Actuator, ActuatorError};
pub use controller::{error_policy, reconcile, Context, MachineClient, MachineClientImpl};
