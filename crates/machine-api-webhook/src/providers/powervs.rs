//! IBM Power Virtual Server providerSpec policy

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use machine_api_common::Platform;

use super::field;
use crate::policy::{
    ClusterInfo, ProviderPolicy, SecretRef, SpecTarget, Verdict, DEFAULT_USER_DATA_SECRET,
};

const DEFAULT_CREDENTIALS_SECRET: &str = "powervs-credentials";

const RESOURCE_TYPES: &[&str] = &["ID", "Name", "RegEx"];
const SYSTEM_TYPES: &[&str] = &["", "s922", "e880", "e980"];
const PROCESSOR_TYPES: &[&str] = &["", "Dedicated", "Shared", "Capped"];

/// Reference to a PowerVS resource by ID, name or name pattern
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PowerVsResource {
    /// `ID`, `Name` or `RegEx`
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Name pattern
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl PowerVsResource {
    fn value_for_type(&self) -> Option<(&'static str, Option<&str>)> {
        match self.type_.as_str() {
            "ID" => Some(("id", self.id.as_deref())),
            "Name" => Some(("name", self.name.as_deref())),
            "RegEx" => Some(("regex", self.regex.as_deref())),
            _ => None,
        }
    }
}

/// `PowerVSMachineProviderConfig`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerVsProviderSpec {
    /// Secret holding user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretRef>,
    /// Secret holding the IBM Cloud API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretRef>,
    /// Workspace hosting the instance
    #[serde(default)]
    pub service_instance: PowerVsResource,
    /// Boot image
    #[serde(default)]
    pub image: PowerVsResource,
    /// Network
    #[serde(default)]
    pub network: PowerVsResource,
    /// SSH key pair
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_pair_name: String,
    /// Machine family
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub system_type: String,
    /// Processor sharing mode
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub processor_type: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// PowerVS policy
#[derive(Clone, Copy, Debug, Default)]
pub struct PowerVsPolicy;

impl ProviderPolicy for PowerVsPolicy {
    type Spec = PowerVsProviderSpec;
    const PLATFORM: Platform = Platform::PowerVs;

    fn apply_defaults(&self, spec: &mut PowerVsProviderSpec, _cluster: &ClusterInfo) {
        if spec.user_data_secret.is_none() {
            spec.user_data_secret = Some(SecretRef::named(DEFAULT_USER_DATA_SECRET));
        }
        if spec.credentials_secret.is_none() {
            spec.credentials_secret = Some(SecretRef::named(DEFAULT_CREDENTIALS_SECRET));
        }
    }

    fn validate(&self, spec: &PowerVsProviderSpec, _target: &SpecTarget<'_>) -> Verdict {
        let mut verdict = Verdict::new();

        validate_resource(&spec.service_instance, "serviceInstance", &mut verdict);
        validate_resource(&spec.image, "image", &mut verdict);
        validate_resource(&spec.network, "network", &mut verdict);

        verdict.require(
            !spec.key_pair_name.is_empty(),
            &field("keyPairName"),
            "providerSpec.keyPairName must be provided",
        );
        verdict.one_of(&spec.system_type, SYSTEM_TYPES, &field("systemType"));
        verdict.one_of(&spec.processor_type, PROCESSOR_TYPES, &field("processorType"));

        verdict.require(
            spec.user_data_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("userDataSecret"),
            "providerSpec.userDataSecret must be provided",
        );
        verdict.require(
            spec.credentials_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("credentialsSecret"),
            "providerSpec.credentialsSecret must be provided",
        );

        verdict
    }

    fn credentials_secret(&self, spec: &PowerVsProviderSpec) -> Option<SecretRef> {
        spec.credentials_secret.clone().filter(SecretRef::is_set)
    }
}

fn validate_resource(resource: &PowerVsResource, name: &str, verdict: &mut Verdict) {
    let path = field(&format!("{name}.type"));
    if resource.type_.is_empty() {
        verdict.require(false, &path, format!("{name} identifier must be provided"));
        return;
    }
    match resource.value_for_type() {
        Some((key, value)) => verdict.require(
            value.is_some_and(|v| !v.is_empty()),
            &field(&format!("{name}.{key}")),
            format!("{name} identifier is specified as {} but the value is nil", resource.type_),
        ),
        None => verdict.one_of(&resource.type_, RESOURCE_TYPES, &path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SpecPolicy;
    use serde_json::json;

    fn validate(value: Value) -> Verdict {
        let cluster = ClusterInfo::default();
        PowerVsPolicy.validate_value(
            Some(&value),
            &SpecTarget {
                name: "worker-0",
                cluster: &cluster,
            },
        )
    }

    fn valid() -> Value {
        PowerVsPolicy
            .default_value(
                Some(&json!({
                    "serviceInstance": {"type": "ID", "id": "0123"},
                    "image": {"type": "Name", "name": "rhcos"},
                    "network": {"type": "RegEx", "regex": "^DHCP.*"},
                    "keyPairName": "key",
                    "systemType": "s922",
                    "processorType": "Shared",
                })),
                &ClusterInfo::default(),
            )
            .unwrap()
    }

    #[test]
    fn complete_spec_is_admitted() {
        let value = valid();
        assert_eq!(value["credentialsSecret"]["name"], DEFAULT_CREDENTIALS_SECRET);
        let verdict = validate(value);
        assert!(verdict.is_allowed(), "{}", verdict.message());
    }

    #[test]
    fn identifier_type_needs_a_matching_value() {
        let mut spec = valid();
        spec["image"] = json!({"type": "ID", "name": "rhcos"});
        let verdict = validate(spec);
        assert_eq!(verdict.errors.len(), 1);
        assert_eq!(verdict.errors[0].field, "providerSpec.image.id");
    }

    #[test]
    fn identifier_type_must_be_known() {
        let mut spec = valid();
        spec["network"] = json!({"type": "Tag", "name": "n"});
        let verdict = validate(spec);
        assert_eq!(verdict.errors[0].field, "providerSpec.network.type");
        assert!(verdict.errors[0].message.starts_with("Unsupported value"));
    }

    #[test]
    fn missing_identifiers_and_key_are_required() {
        let spec = PowerVsPolicy.default_value(None, &ClusterInfo::default()).unwrap();
        let fields: Vec<String> = validate(spec).errors.into_iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec![
                "providerSpec.serviceInstance.type",
                "providerSpec.image.type",
                "providerSpec.network.type",
                "providerSpec.keyPairName",
            ]
        );
    }

    #[test]
    fn system_and_processor_types_are_enumerated() {
        let mut spec = valid();
        spec["systemType"] = json!("s1022x");
        spec["processorType"] = json!("Burst");
        assert_eq!(validate(spec).errors.len(), 2);
    }
}
