//! Cluster facts from the `config.openshift.io/v1` Infrastructure object
//!
//! The webhook needs the platform and infrastructure name for defaulting.
//! Flags win; the cluster-scoped `cluster` Infrastructure fills the gaps.

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client};
use serde_json::Value;
use tracing::info;

use machine_api_common::retry::{retry_with_backoff, RetryConfig};
use machine_api_common::{Error, Platform};
use machine_api_webhook::ClusterInfo;

use crate::config::WebhookArgs;

const INFRASTRUCTURE_NAME: &str = "cluster";
const DISCOVERY_ATTEMPTS: u32 = 10;

fn infrastructure_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(
        &GroupVersionKind::gvk("config.openshift.io", "v1", "Infrastructure"),
        "infrastructures",
    )
}

/// Read cluster facts from the Infrastructure object, retrying transient failures
pub async fn discover(client: &Client) -> Result<ClusterInfo, Error> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &infrastructure_resource());
    let infrastructure = retry_with_backoff(
        &RetryConfig::with_max_attempts(DISCOVERY_ATTEMPTS),
        "get infrastructure",
        || {
            let api = api.clone();
            async move { api.get(INFRASTRUCTURE_NAME).await.map_err(Error::from) }
        },
    )
    .await?;
    let cluster = from_status(&infrastructure.data)?;
    info!(
        platform = %cluster.platform,
        cluster_id = %cluster.cluster_id,
        "Discovered cluster infrastructure"
    );
    Ok(cluster)
}

/// Cluster facts from an Infrastructure object's fields
pub fn from_status(data: &Value) -> Result<ClusterInfo, Error> {
    let status = &data["status"];
    let platform_status = &status["platformStatus"];

    let platform_name = platform_status["type"]
        .as_str()
        .or_else(|| status["platform"].as_str())
        .unwrap_or_default();
    let platform: Platform = platform_name.parse()?;

    let cluster_id = status["infrastructureName"]
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::validation("infrastructure status has no infrastructureName"))?
        .to_string();

    let text = |pointer: &str| {
        platform_status
            .pointer(pointer)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let region = match platform {
        Platform::Aws => text("/aws/region"),
        Platform::Gcp => text("/gcp/region"),
        Platform::PowerVs => text("/powervs/region"),
        _ => None,
    };

    Ok(ClusterInfo {
        platform,
        cluster_id,
        region,
        gcp_project_id: text("/gcp/projectID"),
        vsphere_datacenter: None,
    })
}

/// Cluster facts for the webhook: flags first, then discovery
pub async fn resolve(client: &Client, args: &WebhookArgs) -> Result<ClusterInfo, Error> {
    let discovered = match (&args.platform, &args.cluster_id) {
        (Some(_), Some(_)) => None,
        _ => Some(discover(client).await?),
    };
    Ok(merge_flags(args, discovered))
}

/// Overlay explicitly set flags onto discovered facts
pub fn merge_flags(args: &WebhookArgs, discovered: Option<ClusterInfo>) -> ClusterInfo {
    let discovered = discovered.unwrap_or_default();
    ClusterInfo {
        platform: args.platform.unwrap_or(discovered.platform),
        cluster_id: args.cluster_id.clone().unwrap_or(discovered.cluster_id),
        region: args.region.clone().or(discovered.region),
        gcp_project_id: args.gcp_project_id.clone().or(discovered.gcp_project_id),
        vsphere_datacenter: args
            .vsphere_datacenter
            .clone()
            .or(discovered.vsphere_datacenter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn args() -> WebhookArgs {
        WebhookArgs {
            webhook_port: 9443,
            cert_dir: PathBuf::from("/tmp"),
            platform: None,
            cluster_id: None,
            region: None,
            gcp_project_id: None,
            vsphere_datacenter: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn aws_status_yields_region() {
        let cluster = from_status(&json!({
            "status": {
                "infrastructureName": "demo-x7k2p",
                "platformStatus": {"type": "AWS", "aws": {"region": "us-east-1"}},
            }
        }))
        .unwrap();

        assert_eq!(cluster.platform, Platform::Aws);
        assert_eq!(cluster.cluster_id, "demo-x7k2p");
        assert_eq!(cluster.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn gcp_status_yields_project() {
        let cluster = from_status(&json!({
            "status": {
                "infrastructureName": "demo",
                "platformStatus": {"type": "GCP", "gcp": {"region": "us-central1", "projectID": "proj"}},
            }
        }))
        .unwrap();

        assert_eq!(cluster.region.as_deref(), Some("us-central1"));
        assert_eq!(cluster.gcp_project_id.as_deref(), Some("proj"));
    }

    #[test]
    fn legacy_platform_field_is_honoured() {
        let cluster = from_status(&json!({
            "status": {"infrastructureName": "demo", "platform": "VSphere"}
        }))
        .unwrap();
        assert_eq!(cluster.platform, Platform::VSphere);
    }

    #[test]
    fn missing_infrastructure_name_is_an_error() {
        assert!(from_status(&json!({"status": {"platform": "AWS"}})).is_err());
    }

    #[test]
    fn flags_override_discovery() {
        let mut args = args();
        args.region = Some("eu-west-1".to_string());
        args.vsphere_datacenter = Some("dc1".to_string());

        let cluster = merge_flags(
            &args,
            Some(ClusterInfo {
                platform: Platform::Aws,
                cluster_id: "demo".to_string(),
                region: Some("us-east-1".to_string()),
                ..Default::default()
            }),
        );

        assert_eq!(cluster.platform, Platform::Aws);
        assert_eq!(cluster.cluster_id, "demo");
        assert_eq!(cluster.region.as_deref(), Some("eu-west-1"));
        assert_eq!(cluster.vsphere_datacenter.as_deref(), Some("dc1"));
    }

    #[test]
    fn flags_alone_are_enough() {
        let mut args = args();
        args.platform = Some(Platform::Nutanix);
        args.cluster_id = Some("edge".to_string());

        let cluster = merge_flags(&args, None);
        assert_eq!(cluster.platform, Platform::Nutanix);
        assert_eq!(cluster.cluster_id, "edge");
    }
}
