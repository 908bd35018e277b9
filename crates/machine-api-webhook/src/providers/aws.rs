//! AWS providerSpec policy

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use machine_api_common::Platform;

use super::{field, is_arm64};
use crate::policy::{
    first_duplicates, ClusterInfo, ProviderPolicy, SecretRef, SpecTarget, Verdict,
    DEFAULT_USER_DATA_SECRET,
};

const DEFAULT_CREDENTIALS_SECRET: &str = "aws-cloud-credentials";
const DEFAULT_INSTANCE_TYPE_AMD64: &str = "m6i.large";
const DEFAULT_INSTANCE_TYPE_ARM64: &str = "m6g.large";

const TENANCIES: &[&str] = &["", "default", "dedicated", "host"];
const NETWORK_INTERFACE_TYPES: &[&str] = &["", "ENA", "EFA"];
const METADATA_AUTHENTICATION: &[&str] = &["", "Optional", "Required"];

/// AWS resource selected by ID, ARN or filters
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsResourceReference {
    /// Resource ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Resource ARN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    /// Tag or attribute filters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<Filter>>,
}

impl AwsResourceReference {
    fn is_empty(&self) -> bool {
        self.id.is_none() && self.arn.is_none() && self.filters.is_none()
    }

    fn filter(name: &str, value: String) -> Self {
        Self {
            filters: Some(vec![Filter {
                name: name.to_string(),
                values: vec![value],
            }]),
            ..Default::default()
        }
    }
}

/// EC2 describe filter
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Filter {
    /// Filter name, such as `tag:Name`
    pub name: String,
    /// Accepted values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Resource tag
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Tag {
    /// Tag key
    pub name: String,
    /// Tag value
    #[serde(default)]
    pub value: String,
}

/// Where the instance runs
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// Availability zone
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
    /// Tenancy: default, dedicated or host
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenancy: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Instance metadata service settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataServiceOptions {
    /// IMDSv2 requirement
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authentication: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// `AWSMachineProviderConfig`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsProviderSpec {
    /// Boot image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ami: Option<AwsResourceReference>,
    /// EC2 instance type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_type: String,
    /// Tags applied to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<Tag>,
    /// Instance profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iam_instance_profile: Option<AwsResourceReference>,
    /// Secret holding user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretRef>,
    /// Secret holding cloud credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretRef>,
    /// Security groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Vec<AwsResourceReference>>,
    /// Subnet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<AwsResourceReference>,
    /// Placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,
    /// ENA or EFA
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_interface_type: String,
    /// Instance metadata service settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_service_options: Option<MetadataServiceOptions>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// AWS policy
#[derive(Clone, Copy, Debug, Default)]
pub struct AwsPolicy;

impl ProviderPolicy for AwsPolicy {
    type Spec = AwsProviderSpec;
    const PLATFORM: Platform = Platform::Aws;

    fn apply_defaults(&self, spec: &mut AwsProviderSpec, cluster: &ClusterInfo) {
        let cluster_id = &cluster.cluster_id;
        if spec.instance_type.is_empty() {
            spec.instance_type = if is_arm64() {
                DEFAULT_INSTANCE_TYPE_ARM64
            } else {
                DEFAULT_INSTANCE_TYPE_AMD64
            }
            .to_string();
        }
        if spec.iam_instance_profile.is_none() {
            spec.iam_instance_profile = Some(AwsResourceReference {
                id: Some(format!("{cluster_id}-worker-profile")),
                ..Default::default()
            });
        }
        if spec.user_data_secret.is_none() {
            spec.user_data_secret = Some(SecretRef::named(DEFAULT_USER_DATA_SECRET));
        }
        if spec.credentials_secret.is_none() {
            spec.credentials_secret = Some(SecretRef::named(DEFAULT_CREDENTIALS_SECRET));
        }
        if spec.security_groups.is_none() {
            spec.security_groups = Some(vec![AwsResourceReference::filter(
                "tag:Name",
                format!("{cluster_id}-worker-sg"),
            )]);
        }

        let placement = spec.placement.get_or_insert_with(Default::default);
        if placement.region.is_empty() {
            if let Some(region) = &cluster.region {
                placement.region = region.clone();
            }
        }
        let zone = placement.availability_zone.clone();
        if spec.subnet.as_ref().map_or(true, AwsResourceReference::is_empty) && !zone.is_empty() {
            spec.subnet = Some(AwsResourceReference::filter(
                "tag:Name",
                format!("{cluster_id}-private-{zone}"),
            ));
        }
    }

    fn validate(&self, spec: &AwsProviderSpec, _target: &SpecTarget<'_>) -> Verdict {
        let mut verdict = Verdict::new();

        match &spec.ami {
            Some(ami) if !ami.is_empty() => {
                if ami.id.is_some() && ami.filters.is_some() {
                    verdict.warn(format!(
                        "{}: can't use providerSpec.ami.filters when providerSpec.ami.id is set; filters will be ignored",
                        field("ami")
                    ));
                }
            }
            _ => verdict.require(
                false,
                &field("ami"),
                "expected providerSpec.ami.id to be populated",
            ),
        }

        let placement = spec.placement.clone().unwrap_or_default();
        verdict.require(
            !placement.region.is_empty(),
            &field("placement.region"),
            "expected providerSpec.placement.region to be populated",
        );
        verdict.one_of(&placement.tenancy, TENANCIES, &field("placement.tenancy"));

        verdict.require(
            !spec.instance_type.is_empty(),
            &field("instanceType"),
            "expected providerSpec.instanceType to be populated",
        );
        verdict.require(
            spec.user_data_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("userDataSecret"),
            "expected providerSpec.userDataSecret to be populated",
        );
        verdict.require(
            spec.credentials_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("credentialsSecret"),
            "expected providerSpec.credentialsSecret to be populated",
        );

        verdict.one_of(
            &spec.network_interface_type,
            NETWORK_INTERFACE_TYPES,
            &field("networkInterfaceType"),
        );
        if let Some(options) = &spec.metadata_service_options {
            verdict.one_of(
                &options.authentication,
                METADATA_AUTHENTICATION,
                &field("metadataServiceOptions.authentication"),
            );
        }

        let duplicates = first_duplicates(spec.tags.iter().map(|t| t.name.as_str()));
        if !duplicates.is_empty() {
            verdict.warn(format!(
                "{}: duplicated tag names ({}): only the first value will be used.",
                field("tags"),
                duplicates.join(",")
            ));
        }

        verdict
    }

    fn credentials_secret(&self, spec: &AwsProviderSpec) -> Option<SecretRef> {
        spec.credentials_secret.clone().filter(SecretRef::is_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SpecPolicy;
    use serde_json::json;

    fn cluster() -> ClusterInfo {
        ClusterInfo {
            platform: Platform::Aws,
            cluster_id: "demo-x7k2p".to_string(),
            region: Some("us-east-1".to_string()),
            ..Default::default()
        }
    }

    fn validate(value: Value) -> Verdict {
        let cluster = cluster();
        AwsPolicy.validate_value(
            Some(&value),
            &SpecTarget {
                name: "worker-0",
                cluster: &cluster,
            },
        )
    }

    fn valid() -> Value {
        json!({
            "ami": {"id": "ami-123"},
            "instanceType": "m6i.large",
            "placement": {"region": "us-east-1", "availabilityZone": "us-east-1a"},
            "userDataSecret": {"name": "worker-user-data"},
            "credentialsSecret": {"name": "aws-cloud-credentials"}
        })
    }

    #[test]
    fn defaults_fill_cluster_derived_fields() {
        let value = AwsPolicy
            .default_value(
                Some(&json!({"placement": {"availabilityZone": "us-east-1a"}, "keyName": "ops"})),
                &cluster(),
            )
            .unwrap();

        assert_eq!(value["placement"]["region"], "us-east-1");
        assert_eq!(value["iamInstanceProfile"]["id"], "demo-x7k2p-worker-profile");
        assert_eq!(value["credentialsSecret"]["name"], DEFAULT_CREDENTIALS_SECRET);
        assert_eq!(value["userDataSecret"]["name"], DEFAULT_USER_DATA_SECRET);
        assert_eq!(
            value["securityGroups"][0]["filters"][0]["values"][0],
            "demo-x7k2p-worker-sg"
        );
        assert_eq!(
            value["subnet"]["filters"][0]["values"][0],
            "demo-x7k2p-private-us-east-1a"
        );
        assert!(!value["instanceType"].as_str().unwrap().is_empty());
        assert_eq!(value["keyName"], "ops");
    }

    #[test]
    fn defaults_keep_explicit_values() {
        let value = AwsPolicy
            .default_value(
                Some(&json!({"instanceType": "c5.xlarge", "subnet": {"id": "subnet-1"}})),
                &cluster(),
            )
            .unwrap();
        assert_eq!(value["instanceType"], "c5.xlarge");
        assert_eq!(value["subnet"], json!({"id": "subnet-1"}));
    }

    #[test]
    fn complete_spec_is_admitted() {
        let verdict = validate(valid());
        assert!(verdict.is_allowed(), "{}", verdict.message());
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn required_fields_are_reported() {
        let verdict = validate(json!({}));
        let fields: Vec<_> = verdict.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "providerSpec.ami",
                "providerSpec.placement.region",
                "providerSpec.instanceType",
                "providerSpec.userDataSecret",
                "providerSpec.credentialsSecret",
            ]
        );
    }

    #[test]
    fn enumerations_are_checked() {
        let mut spec = valid();
        spec["placement"]["tenancy"] = json!("shared");
        spec["networkInterfaceType"] = json!("SRIOV");
        spec["metadataServiceOptions"] = json!({"authentication": "Maybe"});

        let verdict = validate(spec);
        assert_eq!(verdict.errors.len(), 3);
    }

    #[test]
    fn ami_id_with_filters_only_warns() {
        let mut spec = valid();
        spec["ami"]["filters"] = json!([{"name": "tag:Name", "values": ["rhcos"]}]);

        let verdict = validate(spec);
        assert!(verdict.is_allowed());
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[test]
    fn duplicate_tags_warn_naming_each_key_once() {
        let mut spec = valid();
        spec["tags"] = json!([
            {"name": "team", "value": "a"},
            {"name": "team", "value": "b"},
            {"name": "team", "value": "c"},
            {"name": "env", "value": "x"}
        ]);

        let verdict = validate(spec);
        assert!(verdict.is_allowed());
        assert_eq!(
            verdict.warnings,
            vec!["providerSpec.tags: duplicated tag names (team): only the first value will be used."]
        );
    }
}
