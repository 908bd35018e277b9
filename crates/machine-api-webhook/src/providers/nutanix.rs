//! Nutanix providerSpec policy

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use machine_api_common::Platform;

use super::field;
use crate::policy::{
    ClusterInfo, ProviderPolicy, SecretRef, SpecTarget, Verdict, DEFAULT_USER_DATA_SECRET,
};

const DEFAULT_CREDENTIALS_SECRET: &str = "nutanix-credentials";

const IDENTIFIER_TYPES: &[&str] = &["uuid", "name"];
const BOOT_TYPES: &[&str] = &["", "Legacy", "UEFI", "SecureBoot"];

/// Prism resource identifier
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ResourceIdentifier {
    /// `uuid` or `name`
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    /// UUID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `NutanixMachineProviderConfig`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NutanixProviderSpec {
    /// Secret holding user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretRef>,
    /// Secret holding Prism credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretRef>,
    /// Prism Element cluster
    #[serde(default)]
    pub cluster: ResourceIdentifier,
    /// Boot image
    #[serde(default)]
    pub image: ResourceIdentifier,
    /// Attached subnets
    #[serde(default)]
    pub subnets: Vec<ResourceIdentifier>,
    /// vCPUs per socket
    #[serde(default)]
    pub vcpus_per_socket: i32,
    /// Sockets
    #[serde(default)]
    pub vcpu_sockets: i32,
    /// Memory quantity, e.g. `16Gi`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memory_size: String,
    /// System disk quantity
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_disk_size: String,
    /// Firmware boot mode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub boot_type: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Nutanix policy
#[derive(Clone, Copy, Debug, Default)]
pub struct NutanixPolicy;

impl ProviderPolicy for NutanixPolicy {
    type Spec = NutanixProviderSpec;
    const PLATFORM: Platform = Platform::Nutanix;

    fn apply_defaults(&self, spec: &mut NutanixProviderSpec, _cluster: &ClusterInfo) {
        if spec.user_data_secret.is_none() {
            spec.user_data_secret = Some(SecretRef::named(DEFAULT_USER_DATA_SECRET));
        }
        if spec.credentials_secret.is_none() {
            spec.credentials_secret = Some(SecretRef::named(DEFAULT_CREDENTIALS_SECRET));
        }
    }

    fn validate(&self, spec: &NutanixProviderSpec, _target: &SpecTarget<'_>) -> Verdict {
        let mut verdict = Verdict::new();

        validate_identifier(&spec.cluster, &field("cluster"), &mut verdict);
        validate_identifier(&spec.image, &field("image"), &mut verdict);

        verdict.require(
            !spec.subnets.is_empty(),
            &field("subnets"),
            "at least one subnet is needed to create the VM",
        );
        for (i, subnet) in spec.subnets.iter().enumerate() {
            validate_identifier(subnet, &field(&format!("subnets[{i}]")), &mut verdict);
        }

        if spec.vcpus_per_socket < 1 {
            verdict.error(
                field("vcpusPerSocket"),
                format!(
                    "Invalid value: {}: the minimum vCPUs per socket is 1",
                    spec.vcpus_per_socket
                ),
            );
        }
        if spec.vcpu_sockets < 1 {
            verdict.error(
                field("vcpuSockets"),
                format!(
                    "Invalid value: {}: the minimum vCPU sockets is 1",
                    spec.vcpu_sockets
                ),
            );
        }
        verdict.require(
            !spec.memory_size.is_empty(),
            &field("memorySize"),
            "memorySize must be provided",
        );
        verdict.require(
            !spec.system_disk_size.is_empty(),
            &field("systemDiskSize"),
            "systemDiskSize must be provided",
        );
        verdict.one_of(&spec.boot_type, BOOT_TYPES, &field("bootType"));

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

    fn credentials_secret(&self, spec: &NutanixProviderSpec) -> Option<SecretRef> {
        spec.credentials_secret.clone().filter(SecretRef::is_set)
    }
}

fn validate_identifier(id: &ResourceIdentifier, path: &str, verdict: &mut Verdict) {
    let value = match id.type_.as_str() {
        "uuid" => id.uuid.as_deref(),
        "name" => id.name.as_deref(),
        "" => {
            verdict.require(false, &format!("{path}.type"), "identifier type must be provided");
            return;
        }
        other => {
            verdict.one_of(other, IDENTIFIER_TYPES, &format!("{path}.type"));
            return;
        }
    };
    verdict.require(
        value.is_some_and(|v| !v.is_empty()),
        &format!("{path}.{}", id.type_),
        format!("{} must be set when the identifier type is {}", id.type_, id.type_),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SpecPolicy;
    use serde_json::json;

    fn validate(value: Value) -> Verdict {
        let cluster = ClusterInfo::default();
        NutanixPolicy.validate_value(
            Some(&value),
            &SpecTarget {
                name: "worker-0",
                cluster: &cluster,
            },
        )
    }

    fn valid() -> Value {
        NutanixPolicy
            .default_value(
                Some(&json!({
                    "cluster": {"type": "name", "name": "pe-1"},
                    "image": {"type": "uuid", "uuid": "8a5b-..."},
                    "subnets": [{"type": "name", "name": "vlan-0"}],
                    "vcpusPerSocket": 1,
                    "vcpuSockets": 4,
                    "memorySize": "16Gi",
                    "systemDiskSize": "120Gi",
                    "bootType": "UEFI",
                })),
                &ClusterInfo::default(),
            )
            .unwrap()
    }

    #[test]
    fn complete_spec_is_admitted() {
        let verdict = validate(valid());
        assert!(verdict.is_allowed(), "{}", verdict.message());
    }

    #[test]
    fn identifiers_need_values_for_their_type() {
        let mut spec = valid();
        spec["cluster"] = json!({"type": "uuid", "name": "pe-1"});
        spec["subnets"] = json!([{"type": "label"}]);
        let fields: Vec<String> = validate(spec).errors.into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["providerSpec.cluster.uuid", "providerSpec.subnets[0].type"]
        );
    }

    #[test]
    fn subnets_and_sizes_are_required() {
        let mut spec = valid();
        spec["subnets"] = json!([]);
        spec["vcpuSockets"] = json!(0);
        spec.as_object_mut().unwrap().remove("memorySize");
        let fields: Vec<String> = validate(spec).errors.into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "providerSpec.subnets",
                "providerSpec.vcpuSockets",
                "providerSpec.memorySize",
            ]
        );
    }

    #[test]
    fn boot_type_is_enumerated() {
        let mut spec = valid();
        spec["bootType"] = json!("BIOS");
        assert_eq!(validate(spec).errors[0].field, "providerSpec.bootType");
    }
}
