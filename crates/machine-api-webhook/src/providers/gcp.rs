//! GCP providerSpec policy

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use machine_api_common::Platform;

use super::field;
use crate::policy::{
    ClusterInfo, ProviderPolicy, SecretRef, SpecTarget, Verdict, DEFAULT_USER_DATA_SECRET,
};

const DEFAULT_CREDENTIALS_SECRET: &str = "gcp-cloud-credentials";
const DEFAULT_MACHINE_TYPE: &str = "n1-standard-4";
const DEFAULT_DISK_SIZE_GB: i64 = 128;
const DEFAULT_DISK_TYPE: &str = "pd-ssd";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const MIN_DISK_SIZE_GB: i64 = 16;
const MAX_DISK_SIZE_GB: i64 = 65536;
const DISK_TYPES: &[&str] = &["pd-standard", "pd-ssd", "pd-balanced"];
const HOST_MAINTENANCE: &[&str] = &["", "Migrate", "Terminate"];
const RESTART_POLICIES: &[&str] = &["", "Always", "Never"];
const CONFIDENTIAL_COMPUTE: &[&str] = &["", "Enabled", "Disabled"];

const A100: &str = "nvidia-tesla-a100";
const A2_PREFIX: &str = "a2-";

/// Attached disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Delete with the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_delete: Option<bool>,
    /// Boot disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<bool>,
    /// Size in GB
    #[serde(default)]
    pub size_gb: i64,
    /// Disk type
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    /// Source image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Network attachment
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// VPC network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// Subnetwork
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnetwork: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Service account attached to the instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ServiceAccount {
    /// Account email
    #[serde(default)]
    pub email: String,
    /// OAuth scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Accelerator request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Gpu {
    /// Number of accelerators
    #[serde(default)]
    pub count: i32,
    /// Accelerator type
    #[serde(default, rename = "type")]
    pub type_: String,
}

/// `GCPMachineProviderSpec`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpProviderSpec {
    /// Secret holding user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretRef>,
    /// Secret holding cloud credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretRef>,
    /// Machine type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_type: String,
    /// Region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// Zone within the region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    /// Project hosting the instance
    #[serde(default, rename = "projectID", skip_serializing_if = "String::is_empty")]
    pub project_id: String,
    /// Disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Service accounts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccount>,
    /// Network tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Accelerators
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gpus: Vec<Gpu>,
    /// Migrate or Terminate on host maintenance
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub on_host_maintenance: String,
    /// Restart behavior after a failure
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,
    /// Confidential VM setting
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub confidential_compute: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// GCP policy
#[derive(Clone, Copy, Debug, Default)]
pub struct GcpPolicy;

impl ProviderPolicy for GcpPolicy {
    type Spec = GcpProviderSpec;
    const PLATFORM: Platform = Platform::Gcp;

    fn apply_defaults(&self, spec: &mut GcpProviderSpec, cluster: &ClusterInfo) {
        let cluster_id = &cluster.cluster_id;
        if spec.machine_type.is_empty() {
            spec.machine_type = DEFAULT_MACHINE_TYPE.to_string();
        }
        if spec.region.is_empty() {
            if let Some(region) = &cluster.region {
                spec.region = region.clone();
            }
        }
        if spec.project_id.is_empty() {
            if let Some(project) = &cluster.gcp_project_id {
                spec.project_id = project.clone();
            }
        }

        if spec.disks.is_empty() {
            spec.disks.push(Disk {
                auto_delete: Some(true),
                boot: Some(true),
                ..Default::default()
            });
        }
        for disk in &mut spec.disks {
            if disk.size_gb == 0 {
                disk.size_gb = DEFAULT_DISK_SIZE_GB;
            }
            if disk.type_.is_empty() {
                disk.type_ = DEFAULT_DISK_TYPE.to_string();
            }
            if disk.image.is_empty() && disk.boot == Some(true) {
                disk.image = format!("{cluster_id}-rhcos-image");
            }
        }

        if spec.network_interfaces.is_empty() {
            spec.network_interfaces.push(NetworkInterface {
                network: format!("{cluster_id}-network"),
                subnetwork: format!("{cluster_id}-worker-subnet"),
                ..Default::default()
            });
        }

        if spec.service_accounts.is_empty() && !spec.project_id.is_empty() {
            spec.service_accounts.push(ServiceAccount {
                email: format!("{cluster_id}-w@{}.iam.gserviceaccount.com", spec.project_id),
                scopes: vec![DEFAULT_SCOPE.to_string()],
            });
        }

        if spec.tags.is_none() {
            spec.tags = Some(vec![format!("{cluster_id}-worker")]);
        }
        if spec.user_data_secret.is_none() {
            spec.user_data_secret = Some(SecretRef::named(DEFAULT_USER_DATA_SECRET));
        }
        if spec.credentials_secret.is_none() {
            spec.credentials_secret = Some(SecretRef::named(DEFAULT_CREDENTIALS_SECRET));
        }
    }

    fn validate(&self, spec: &GcpProviderSpec, _target: &SpecTarget<'_>) -> Verdict {
        let mut verdict = Verdict::new();

        verdict.require(
            !spec.region.is_empty(),
            &field("region"),
            "region is required",
        );
        if !spec.zone.starts_with(&format!("{}-", spec.region)) {
            verdict.error(
                field("zone"),
                format!(
                    "Invalid value: \"{}\": zone not in configured region ({})",
                    spec.zone, spec.region
                ),
            );
        }
        verdict.require(
            !spec.machine_type.is_empty(),
            &field("machineType"),
            "machineType should be set to one of the supported GCP machine types",
        );

        verdict.require(
            !spec.disks.is_empty(),
            &field("disks"),
            "at least 1 disk is required",
        );
        for (i, disk) in spec.disks.iter().enumerate() {
            if !(MIN_DISK_SIZE_GB..=MAX_DISK_SIZE_GB).contains(&disk.size_gb) {
                verdict.error(
                    field(&format!("disks[{i}].sizeGb")),
                    format!(
                        "Invalid value: {}: must be at least {MIN_DISK_SIZE_GB} and at most {MAX_DISK_SIZE_GB}",
                        disk.size_gb
                    ),
                );
            }
            verdict.one_of(&disk.type_, DISK_TYPES, &field(&format!("disks[{i}].type")));
        }

        verdict.require(
            !spec.network_interfaces.is_empty(),
            &field("networkInterfaces"),
            "at least 1 network interface is required",
        );

        validate_gpus(spec, &mut verdict);
        validate_service_accounts(&spec.service_accounts, &mut verdict);

        verdict.one_of(
            &spec.on_host_maintenance,
            HOST_MAINTENANCE,
            &field("onHostMaintenance"),
        );
        verdict.one_of(&spec.restart_policy, RESTART_POLICIES, &field("restartPolicy"));
        verdict.one_of(
            &spec.confidential_compute,
            CONFIDENTIAL_COMPUTE,
            &field("confidentialCompute"),
        );
        if spec.confidential_compute == "Enabled" && spec.on_host_maintenance == "Migrate" {
            verdict.error(
                field("onHostMaintenance"),
                "Invalid value: \"Migrate\": onHostMaintenance must be Terminate when confidentialCompute is Enabled",
            );
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

    fn credentials_secret(&self, spec: &GcpProviderSpec) -> Option<SecretRef> {
        spec.credentials_secret.clone().filter(SecretRef::is_set)
    }
}

fn validate_gpus(spec: &GcpProviderSpec, verdict: &mut Verdict) {
    let a2 = spec.machine_type.starts_with(A2_PREFIX);

    if spec.gpus.len() > 1 {
        verdict.error(field("gpus"), "Too many: more than one GPU type is not supported");
    }
    for (i, gpu) in spec.gpus.iter().enumerate() {
        verdict.require(
            !gpu.type_.is_empty(),
            &field(&format!("gpus[{i}].type")),
            "type is required",
        );
        if gpu.type_ == A100 && !a2 {
            verdict.error(
                field(&format!("gpus[{i}].type")),
                format!("{A100} gpus are only attached to the A2 machine types"),
            );
        }
    }
    if a2 && !spec.gpus.is_empty() {
        verdict.error(
            field("gpus"),
            "A2 machine types have already attached gpus, additional gpus cannot be specified",
        );
    }

    if (a2 || !spec.gpus.is_empty()) && spec.on_host_maintenance != "Terminate" {
        verdict.error(
            field("onHostMaintenance"),
            format!(
                "Invalid value: \"{}\": onHostMaintenance must be Terminate for machines with GPUs",
                spec.on_host_maintenance
            ),
        );
    }
}

fn validate_service_accounts(accounts: &[ServiceAccount], verdict: &mut Verdict) {
    if accounts.len() != 1 {
        verdict.error(
            field("serviceAccounts"),
            format!(
                "Invalid value: {} service accounts supplied: exactly one service account must be supplied",
                accounts.len()
            ),
        );
        return;
    }
    let account = &accounts[0];
    verdict.require(
        !account.email.is_empty(),
        &field("serviceAccounts[0].email"),
        "email is required",
    );
    verdict.require(
        !account.scopes.is_empty(),
        &field("serviceAccounts[0].scopes"),
        "at least 1 scope is required",
    );
}
