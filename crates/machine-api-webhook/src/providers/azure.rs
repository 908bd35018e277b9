//! Azure providerSpec policy

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use machine_api_common::{Platform, MACHINE_API_NAMESPACE};

use super::field;
use crate::policy::{
    ClusterInfo, ProviderPolicy, SecretRef, SpecTarget, Verdict, DEFAULT_USER_DATA_SECRET,
};

const DEFAULT_CREDENTIALS_SECRET: &str = "azure-cloud-credentials";
const DEFAULT_VM_SIZE: &str = "Standard_D4s_v3";
const DEFAULT_OS_DISK_SIZE_GB: i32 = 128;
const DEFAULT_OS_TYPE: &str = "Linux";
const DEFAULT_STORAGE_ACCOUNT_TYPE: &str = "Premium_LRS";

const MAX_OS_DISK_SIZE_GB: i32 = 32768;
const MIN_DATA_DISK_SIZE_GB: i32 = 4;
const MAX_LUN: i32 = 63;
const MAX_DISK_NAME_LENGTH: usize = 80;
const ULTRA_SSD: &str = "UltraSSD_LRS";

const CACHING_TYPES: &[&str] = &["", "None", "ReadOnly", "ReadWrite"];
const EPHEMERAL_LOCATIONS: &[&str] = &["", "Local"];
const DELETION_POLICIES: &[&str] = &["Delete", "Detach"];

/// Marketplace or gallery image
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Marketplace publisher
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub publisher: String,
    /// Marketplace offer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub offer: String,
    /// Marketplace SKU
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sku: String,
    /// Marketplace version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Image resource ID
    #[serde(default, rename = "resourceID", skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Image {
    fn is_empty(&self) -> bool {
        self.publisher.is_empty()
            && self.offer.is_empty()
            && self.sku.is_empty()
            && self.version.is_empty()
            && self.resource_id.is_empty()
    }

    fn has_marketplace_fields(&self) -> bool {
        !(self.publisher.is_empty()
            && self.offer.is_empty()
            && self.sku.is_empty()
            && self.version.is_empty())
    }
}

/// Managed disk parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDisk {
    /// Storage SKU, such as Premium_LRS
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_account_type: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Ephemeral OS disk settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiskSettings {
    /// `Local` for an ephemeral OS disk
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ephemeral_storage_location: String,
}

/// OS disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OsDisk {
    /// Linux or Windows
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_type: String,
    /// Managed disk parameters
    #[serde(default)]
    pub managed_disk: ManagedDisk,
    /// Size in GB
    #[serde(default, rename = "diskSizeGB")]
    pub disk_size_gb: i32,
    /// Host caching
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caching_type: String,
    /// Ephemeral disk settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_settings: Option<DiskSettings>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Additional data disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    /// Appended to the machine name to form the disk name
    #[serde(default)]
    pub name_suffix: String,
    /// Size in GB
    #[serde(default, rename = "diskSizeGB")]
    pub disk_size_gb: i32,
    /// Managed disk parameters
    #[serde(default)]
    pub managed_disk: ManagedDisk,
    /// Logical unit number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lun: Option<i32>,
    /// Host caching
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caching_type: String,
    /// Delete or Detach with the machine
    #[serde(default)]
    pub deletion_policy: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// `AzureMachineProviderSpec`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureProviderSpec {
    /// Secret holding user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret: Option<SecretRef>,
    /// Secret holding cloud credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<SecretRef>,
    /// Region
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
    /// Instance size
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vm_size: String,
    /// Boot image
    #[serde(default)]
    pub image: Image,
    /// OS disk
    #[serde(default)]
    pub os_disk: OsDisk,
    /// Data disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_disks: Vec<DataDisk>,
    /// Virtual network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vnet: String,
    /// Subnet within the virtual network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subnet: String,
    /// Resource group of the network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_resource_group: String,
    /// Resource group of the machine
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_group: String,
    /// Resource tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Azure policy
#[derive(Clone, Copy, Debug, Default)]
pub struct AzurePolicy;

impl ProviderPolicy for AzurePolicy {
    type Spec = AzureProviderSpec;
    const PLATFORM: Platform = Platform::Azure;

    fn apply_defaults(&self, spec: &mut AzureProviderSpec, cluster: &ClusterInfo) {
        let cluster_id = &cluster.cluster_id;
        if spec.vm_size.is_empty() {
            spec.vm_size = DEFAULT_VM_SIZE.to_string();
        }
        if spec.location.is_empty() {
            if let Some(region) = &cluster.region {
                spec.location = region.clone();
            }
        }
        if spec.image.is_empty() {
            spec.image.resource_id = format!(
                "/resourceGroups/{cluster_id}-rg/providers/Microsoft.Compute/images/{cluster_id}"
            );
        }
        if spec.resource_group.is_empty() {
            spec.resource_group = format!("{cluster_id}-rg");
        }
        // Only a fully unset network is defaulted; a half-set one is a
        // validation error.
        if spec.vnet.is_empty() && spec.subnet.is_empty() && spec.network_resource_group.is_empty()
        {
            spec.vnet = format!("{cluster_id}-vnet");
            spec.subnet = format!("{cluster_id}-worker-subnet");
            spec.network_resource_group = format!("{cluster_id}-rg");
        }
        if spec.os_disk.os_type.is_empty() {
            spec.os_disk.os_type = DEFAULT_OS_TYPE.to_string();
        }
        if spec.os_disk.managed_disk.storage_account_type.is_empty() {
            spec.os_disk.managed_disk.storage_account_type =
                DEFAULT_STORAGE_ACCOUNT_TYPE.to_string();
        }
        if spec.os_disk.disk_size_gb == 0 {
            spec.os_disk.disk_size_gb = DEFAULT_OS_DISK_SIZE_GB;
        }
        if spec.user_data_secret.is_none() {
            spec.user_data_secret = Some(SecretRef::named(DEFAULT_USER_DATA_SECRET));
        }
        if spec.credentials_secret.is_none() {
            spec.credentials_secret = Some(SecretRef {
                name: DEFAULT_CREDENTIALS_SECRET.to_string(),
                namespace: MACHINE_API_NAMESPACE.to_string(),
            });
        }
    }

    fn validate(&self, spec: &AzureProviderSpec, target: &SpecTarget<'_>) -> Verdict {
        let mut verdict = Verdict::new();

        verdict.require(
            !spec.vm_size.is_empty(),
            &field("vmSize"),
            "vmSize should be set to one of the supported Azure VM sizes",
        );

        validate_image(&spec.image, &mut verdict);
        validate_os_disk(&spec.os_disk, &mut verdict);
        validate_data_disks(target.name, &spec.data_disks, &mut verdict);

        if spec.vnet.is_empty() != spec.subnet.is_empty() {
            let (missing, other) = if spec.vnet.is_empty() {
                ("vnet", "subnet")
            } else {
                ("subnet", "vnet")
            };
            verdict.require(
                false,
                &field(missing),
                format!("must provide {missing} when {other} is present"),
            );
        }

        verdict.require(
            spec.user_data_secret.as_ref().is_some_and(SecretRef::is_set),
            &field("userDataSecret"),
            "userDataSecret must be provided",
        );
        match &spec.credentials_secret {
            Some(secret) => {
                verdict.require(
                    !secret.namespace.is_empty(),
                    &field("credentialsSecret.namespace"),
                    "credentialsSecret must have a namespace",
                );
                verdict.require(
                    !secret.name.is_empty(),
                    &field("credentialsSecret.name"),
                    "credentialsSecret must have a name",
                );
            }
            None => verdict.require(
                false,
                &field("credentialsSecret"),
                "credentialsSecret must be provided",
            ),
        }

        verdict
    }

    fn credentials_secret(&self, spec: &AzureProviderSpec) -> Option<SecretRef> {
        spec.credentials_secret.clone().filter(SecretRef::is_set)
    }
}

fn validate_image(image: &Image, verdict: &mut Verdict) {
    if !image.resource_id.is_empty() {
        if image.has_marketplace_fields() {
            verdict.error(
                field("image.resourceID"),
                "resourceID is already specified, other fields such as [Offer, Publisher, SKU, Version] should not be set",
            );
        }
        return;
    }

    if !image.has_marketplace_fields() {
        verdict.require(
            false,
            &field("image"),
            "an image must be provided, either resourceID or the marketplace fields [Offer, Publisher, SKU, Version]",
        );
        return;
    }

    for (name, value) in [
        ("offer", &image.offer),
        ("publisher", &image.publisher),
        ("sku", &image.sku),
        ("version", &image.version),
    ] {
        verdict.require(
            !value.is_empty(),
            &field(&format!("image.{name}")),
            format!("{name} must be provided"),
        );
    }
}

fn validate_os_disk(disk: &OsDisk, verdict: &mut Verdict) {
    if disk.disk_size_gb <= 0 || disk.disk_size_gb >= MAX_OS_DISK_SIZE_GB {
        verdict.error(
            field("osDisk.diskSizeGB"),
            format!(
                "Invalid value: {}: diskSizeGB must be greater than zero and less than {MAX_OS_DISK_SIZE_GB}",
                disk.disk_size_gb
            ),
        );
    }

    verdict.one_of(&disk.caching_type, CACHING_TYPES, &field("osDisk.cachingType"));

    let location = disk
        .disk_settings
        .as_ref()
        .map(|s| s.ephemeral_storage_location.as_str())
        .unwrap_or("");
    verdict.one_of(
        location,
        EPHEMERAL_LOCATIONS,
        &field("osDisk.diskSettings.ephemeralStorageLocation"),
    );
    if location == "Local" && disk.caching_type != "ReadOnly" {
        verdict.error(
            field("osDisk.cachingType"),
            format!(
                "Invalid value: \"{}\": instances using an ephemeral OS disk support only ReadOnly caching",
                disk.caching_type
            ),
        );
    }
}

fn validate_data_disks(machine_name: &str, disks: &[DataDisk], verdict: &mut Verdict) {
    let mut suffixes = HashSet::new();
    let mut luns = HashSet::new();

    for (i, disk) in disks.iter().enumerate() {
        let path = |name: &str| field(&format!("dataDisks[{i}].{name}"));

        if disk.name_suffix.is_empty() {
            verdict.require(false, &path("nameSuffix"), "nameSuffix must be provided");
        } else {
            if !is_valid_name_suffix(&disk.name_suffix) {
                verdict.error(
                    path("nameSuffix"),
                    format!(
                        "Invalid value: \"{}\": nameSuffix must start with a letter or number and contain only letters, numbers, underscores, periods or hyphens",
                        disk.name_suffix
                    ),
                );
            }
            let name_length = machine_name.len() + "_".len() + disk.name_suffix.len();
            if name_length > MAX_DISK_NAME_LENGTH {
                verdict.error(
                    path("nameSuffix"),
                    format!(
                        "too long, the overall disk name must not exceed {MAX_DISK_NAME_LENGTH} chars"
                    ),
                );
            }
            if !suffixes.insert(disk.name_suffix.as_str()) {
                verdict.error(
                    path("nameSuffix"),
                    format!(
                        "Duplicate value: \"{}\": nameSuffix must be unique within a machine",
                        disk.name_suffix
                    ),
                );
            }
        }

        if disk.disk_size_gb < MIN_DATA_DISK_SIZE_GB {
            verdict.error(
                path("diskSizeGB"),
                format!(
                    "Invalid value: {}: diskSizeGB must be at least {MIN_DATA_DISK_SIZE_GB}",
                    disk.disk_size_gb
                ),
            );
        }

        match disk.lun {
            None => verdict.require(false, &path("lun"), "lun must be provided"),
            Some(lun) if !(0..=MAX_LUN).contains(&lun) => verdict.error(
                path("lun"),
                format!("Invalid value: {lun}: lun must be between 0 and {MAX_LUN}"),
            ),
            Some(lun) => {
                if !luns.insert(lun) {
                    verdict.error(
                        path("lun"),
                        format!("Duplicate value: {lun}: lun must be unique within a machine"),
                    );
                }
            }
        }

        verdict.one_of(&disk.caching_type, CACHING_TYPES, &path("cachingType"));
        verdict.one_of(&disk.deletion_policy, DELETION_POLICIES, &path("deletionPolicy"));

        if disk.managed_disk.storage_account_type == ULTRA_SSD
            && !matches!(disk.caching_type.as_str(), "" | "None")
        {
            verdict.error(
                path("cachingType"),
                format!(
                    "Invalid value: \"{}\": cachingType must be None or omitted for {ULTRA_SSD} disks",
                    disk.caching_type
                ),
            );
        }
    }
}

/// First character alphanumeric, the rest word characters, `.` or `-`
fn is_valid_name_suffix(suffix: &str) -> bool {
    let mut chars = suffix.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
