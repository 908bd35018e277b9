//! Custom Resource Definitions for the Machine API
//!
//! Machine and MachineSet in group `machine.openshift.io/v1beta1`.

mod machine;
mod machine_set;
mod types;

pub use machine::{Machine, MachineSpec, MachineStatus, INTERNAL_IP};
pub use machine_set::{
    DeletePolicy, MachineSet, MachineSetSpec, MachineSetStatus, MachineTemplateMetadata,
    MachineTemplateSpec,
};
pub use types::{
    AuthoritativeApi, Condition, ConditionSeverity, ConditionStatus, LastOperation,
    LifecycleHook, LifecycleHooks, MachineMetadata, MachinePhase, ProviderSpec,
};
