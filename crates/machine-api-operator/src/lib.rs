//! Machine API operator
//!
//! Wires the Machine, drain and node link reconcilers into controller
//! processes, and serves the Machine and MachineSet admission webhooks.

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod infrastructure;
pub mod manager;
pub mod webhook_server;

pub use manager::run_machine_manager;
