//! Infrastructure platform the cluster runs on
//!
//! The platform decides how `spec.providerSpec.value` is decoded,
//! defaulted and validated at admission.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Infrastructure platform type as reported by the cluster Infrastructure object
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Amazon Web Services
    #[serde(rename = "AWS")]
    Aws,
    /// Microsoft Azure
    Azure,
    /// Google Cloud Platform
    #[serde(rename = "GCP")]
    Gcp,
    /// VMware vSphere
    #[serde(rename = "VSphere")]
    VSphere,
    /// IBM Power Virtual Server
    #[serde(rename = "PowerVS")]
    PowerVs,
    /// Nutanix AHV
    Nutanix,
    /// Bare metal hosts, reconciled elsewhere
    BareMetal,
    /// OpenStack
    OpenStack,
    /// No platform integration
    #[default]
    None,
}

impl Platform {
    /// Canonical spelling used in the Infrastructure status
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "AWS",
            Self::Azure => "Azure",
            Self::Gcp => "GCP",
            Self::VSphere => "VSphere",
            Self::PowerVs => "PowerVS",
            Self::Nutanix => "Nutanix",
            Self::BareMetal => "BareMetal",
            Self::OpenStack => "OpenStack",
            Self::None => "None",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "gcp" => Ok(Self::Gcp),
            "vsphere" => Ok(Self::VSphere),
            "powervs" => Ok(Self::PowerVs),
            "nutanix" => Ok(Self::Nutanix),
            "baremetal" => Ok(Self::BareMetal),
            "openstack" => Ok(Self::OpenStack),
            "" | "none" => Ok(Self::None),
            other => Err(Error::validation(format!(
                "unsupported platform '{other}', expected one of AWS, Azure, GCP, VSphere, PowerVS, Nutanix, BareMetal, OpenStack, None"
            ))),
        }
    }
}
