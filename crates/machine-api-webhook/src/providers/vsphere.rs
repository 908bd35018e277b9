//! vSphere providerSpec policy

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use machine_api_common::Platform;

use super::field;
use crate::policy::{
    ClusterInfo, ProviderPolicy, SecretRef, SpecTarget, Verdict, DEFAULT_USER_DATA_SECRET,
};

const DEFAULT_CREDENTIALS_SECRET: &str = "vsphere-cloud-credentials";

const MIN_CPUS: i32 = 2;
const MIN_MEMORY_MIB: i64 = 2048;
const MIN_DISK_GIB: i32 = 120;
const CLONE_MODES: &[&str] = &["", "fullClone", "linkedClone"];
const LINKED_CLONE: &str = "linkedClone";

/// Where the VM lands in vCenter
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// vCenter server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    /// Datacenter
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datacenter: String,
    /// Inventory folder
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub folder: String,
    /// Datastore
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datastore: String,
    /// Resource pool
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_pool: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// One virtual NIC
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDevice {
    /// Port group the NIC attaches to
    #[serde(default)]
    pub network_name: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// NIC list
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetworkSpec {
    /// Devices
    #[serde(default)]
    pub devices: Vec<NetworkDevice>,
}

/// `VSphereMachineProviderSpec`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereProviderSpec {
    /// Secret holding user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretRef>,
    /// Secret holding vCenter credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretRef>,
    /// VM template to clone
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    /// Placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<Workspace>,
    /// Networking
    #[serde(default)]
    pub network: NetworkSpec,
    /// Virtual CPUs
    #[serde(default, rename = "numCPUs", skip_serializing_if = "is_zero_i32")]
    pub num_cpus: i32,
    /// Cores per socket
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub num_cores_per_socket: i32,
    /// Memory in MiB
    #[serde(default, rename = "memoryMiB", skip_serializing_if = "is_zero_i64")]
    pub memory_mib: i64,
    /// Root disk size in GiB
    #[serde(default, rename = "diskGiB", skip_serializing_if = "is_zero_i32")]
    pub disk_gib: i32,
    /// `fullClone` or `linkedClone`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub clone_mode: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// vSphere policy
#[derive(Clone, Copy, Debug, Default)]
pub struct VSpherePolicy;

impl ProviderPolicy for VSpherePolicy {
    type Spec = VSphereProviderSpec;
    const PLATFORM: Platform = Platform::VSphere;

    fn apply_defaults(&self, spec: &mut VSphereProviderSpec, cluster: &ClusterInfo) {
        if spec.template.is_empty() {
            spec.template = format!("{}-rhcos", cluster.cluster_id);
        }
        if let Some(datacenter) = &cluster.vsphere_datacenter {
            let workspace = spec.workspace.get_or_insert_with(Workspace::default);
            if workspace.datacenter.is_empty() {
                workspace.datacenter = datacenter.clone();
            }
        }
        if spec.user_data_secret.is_none() {
            spec.user_data_secret = Some(SecretRef::named(DEFAULT_USER_DATA_SECRET));
        }
        if spec.credentials_secret.is_none() {
            spec.credentials_secret = Some(SecretRef::named(DEFAULT_CREDENTIALS_SECRET));
        }
    }

    fn validate(&self, spec: &VSphereProviderSpec, _target: &SpecTarget<'_>) -> Verdict {
        let mut verdict = Verdict::new();

        verdict.require(
            !spec.template.is_empty(),
            &field("template"),
            "template must be provided",
        );

        match &spec.workspace {
            None => verdict.require(false, &field("workspace"), "workspace must be provided"),
            Some(workspace) => validate_workspace(workspace, &mut verdict),
        }

        verdict.require(
            !spec.network.devices.is_empty(),
            &field("network.devices"),
            "at least 1 network device must be provided",
        );
        for (i, device) in spec.network.devices.iter().enumerate() {
            verdict.require(
                !device.network_name.is_empty(),
                &field(&format!("network.devices[{i}].networkName")),
                "networkName must be provided",
            );
        }

        if spec.num_cpus < MIN_CPUS {
            verdict.warn(format!(
                "{}: {} is missing or less than the minimum value ({MIN_CPUS}): nodes may not boot correctly",
                field("numCPUs"),
                spec.num_cpus
            ));
        }
        if spec.memory_mib < MIN_MEMORY_MIB {
            verdict.warn(format!(
                "{}: {} is missing or less than the recommended minimum value ({MIN_MEMORY_MIB}): nodes may not boot correctly",
                field("memoryMiB"),
                spec.memory_mib
            ));
        }
        if spec.disk_gib < MIN_DISK_GIB {
            verdict.warn(format!(
                "{}: {} is missing or less than the recommended minimum ({MIN_DISK_GIB}): nodes may fail to start if disk size is too low",
                field("diskGiB"),
                spec.disk_gib
            ));
        }

        verdict.one_of(&spec.clone_mode, CLONE_MODES, &field("cloneMode"));
        if spec.clone_mode == LINKED_CLONE && spec.disk_gib > 0 {
            verdict.warn(format!(
                "{}: linkedClone does not support resizing the template disk, diskGiB will be ignored",
                field("cloneMode")
            ));
        }

        verdict.require(
            spec.user_data_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("userDataSecret"),
            "userDataSecret must be provided",
        );
        verdict.require(
            spec.credentials_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("credentialsSecret"),
            "credentialsSecret must be provided",
        );

        verdict
    }

    fn credentials_secret(&self, spec: &VSphereProviderSpec) -> Option<SecretRef> {
        spec.credentials_secret.clone().filter(SecretRef::is_set)
    }
}

fn validate_workspace(workspace: &Workspace, verdict: &mut Verdict) {
    verdict.require(
        !workspace.server.is_empty(),
        &field("workspace.server"),
        "server must be provided",
    );
    if workspace.folder.is_empty() {
        return;
    }
    let prefix = format!("/{}/vm/", workspace.datacenter);
    if workspace.datacenter.is_empty() || !workspace.folder.starts_with(&prefix) {
        verdict.error(
            field("workspace.folder"),
            format!(
                "Invalid value: \"{}\": folder must be absolute path: expected prefix \"{prefix}\"",
                workspace.folder
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SpecPolicy;
    use serde_json::json;

    fn cluster() -> ClusterInfo {
        ClusterInfo {
            platform: Platform::VSphere,
            cluster_id: "demo".to_string(),
            vsphere_datacenter: Some("dc1".to_string()),
            ..Default::default()
        }
    }

    fn validate(value: Value) -> Verdict {
        let cluster = cluster();
        VSpherePolicy.validate_value(
            Some(&value),
            &SpecTarget {
                name: "worker-0",
                cluster: &cluster,
            },
        )
    }

    fn valid() -> Value {
        let mut value = VSpherePolicy
            .default_value(
                Some(&json!({
                    "workspace": {"server": "vcenter.example.com", "folder": "/dc1/vm/demo"},
                    "network": {"devices": [{"networkName": "VM Network"}]},
                    "numCPUs": 4,
                    "memoryMiB": 16384,
                    "diskGiB": 120,
                })),
                &cluster(),
            )
            .unwrap();
        value["cloneMode"] = json!("fullClone");
        value
    }

    #[test]
    fn defaults_fill_template_and_datacenter() {
        let value = VSpherePolicy.default_value(None, &cluster()).unwrap();
        assert_eq!(value["template"], "demo-rhcos");
        assert_eq!(value["workspace"]["datacenter"], "dc1");
        assert_eq!(value["credentialsSecret"]["name"], DEFAULT_CREDENTIALS_SECRET);

        let verdict = validate(valid());
        assert!(verdict.is_allowed(), "{}", verdict.message());
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn folder_must_live_under_the_datacenter() {
        let mut spec = valid();
        spec["workspace"]["folder"] = json!("/other/vm/demo");
        let verdict = validate(spec);
        assert_eq!(verdict.errors.len(), 1);
        assert_eq!(verdict.errors[0].field, "providerSpec.workspace.folder");
    }

    #[test]
    fn network_devices_need_names() {
        let mut spec = valid();
        spec["network"]["devices"] = json!([{"networkName": ""}]);
        let verdict = validate(spec.clone());
        assert_eq!(
            verdict.errors[0].field,
            "providerSpec.network.devices[0].networkName"
        );

        spec["network"]["devices"] = json!([]);
        assert_eq!(validate(spec).errors[0].field, "providerSpec.network.devices");
    }

    #[test]
    fn small_sizes_only_warn() {
        let mut spec = valid();
        spec["numCPUs"] = json!(1);
        spec["memoryMiB"] = json!(1024);
        spec["diskGiB"] = json!(60);
        let verdict = validate(spec);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.warnings.len(), 3);
    }

    #[test]
    fn linked_clone_ignores_disk_size() {
        let mut spec = valid();
        spec["cloneMode"] = json!("linkedClone");
        let verdict = validate(spec);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[test]
    fn missing_workspace_is_rejected() {
        let mut spec = valid();
        spec.as_object_mut().unwrap().remove("workspace");
        let verdict = validate(spec);
        assert_eq!(verdict.errors[0].field, "providerSpec.workspace");
    }
}
