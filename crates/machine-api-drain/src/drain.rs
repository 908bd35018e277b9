//! Cordon and evict
//!
//! Pods on the node are evicted through the eviction subresource so
//! PodDisruptionBudgets are honored. Mirror pods and DaemonSet pods stay.
//! Each pod gets a fixed window to be evicted and disappear; a pod that
//! outlasts it makes the drain report a timeout instead of an error so the
//! caller can come back later.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use machine_api_common::crd::Machine;
use machine_api_common::Error;

/// How long a single pod may take to be evicted and go away
pub const POD_EVICTION_TIMEOUT: Duration = Duration::from_secs(20);

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const UNREACHABLE_GRACE_PERIOD_SECS: u32 = 1;
const UNREACHABLE_SKIP_WAIT: Duration = Duration::from_secs(1);
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const FIELD_MANAGER: &str = "machine-drain-controller";

/// Result of a single eviction request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictionResult {
    /// The API server accepted the eviction
    Evicted,
    /// The pod no longer exists
    Gone,
    /// A disruption budget refused the eviction for now (HTTP 429)
    Blocked(String),
}

/// Kubernetes operations the drain controller performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DrainClient: Send + Sync {
    /// Fetch a node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Mark a node unschedulable
    async fn cordon(&self, name: &str) -> Result<(), Error>;

    /// All pods scheduled to a node
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, Error>;

    /// Request eviction of a pod
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<EvictionResult, Error>;

    /// Fetch a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Write the Machine's status, guarded by resourceVersion
    async fn patch_machine_status(&self, machine: &Machine) -> Result<(), Error>;
}

/// Production [`DrainClient`] backed by the API server
pub struct KubeDrainClient {
    client: Client,
}

impl KubeDrainClient {
    /// Create a client wrapper
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DrainClient for KubeDrainClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn cordon(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": true } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<EvictionResult, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: grace_period_secs.map(|g| DeleteParams::default().grace_period(g)),
            ..Default::default()
        };
        match api.evict(name, &params).await {
            Ok(_) => Ok(EvictionResult::Evicted),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(EvictionResult::Gone),
            Err(kube::Error::Api(e)) if e.code == 429 => Ok(EvictionResult::Blocked(e.message)),
            Err(e) => Err(Error::drain(
                format!("{namespace}/{name}"),
                format!("eviction failed: {e}"),
            )),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_machine_status(&self, machine: &Machine) -> Result<(), Error> {
        let api: Api<Machine> =
            Api::namespaced(self.client.clone(), &machine.namespace().unwrap_or_default());
        let patch = json!({
            "metadata": { "resourceVersion": machine.resource_version() },
            "status": machine.status
        });
        api.patch_status(
            &machine.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| Error::from(e).for_resource(machine.key()))?;
        Ok(())
    }
}

/// Drain tuning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainOptions {
    /// Grace period override for evicted pods; `None` keeps each pod's own
    pub grace_period_secs: Option<u32>,
    /// Per-pod window to be evicted and disappear
    pub pod_timeout: Duration,
    /// Treat pods terminating for longer than this as gone
    pub skip_wait_for_delete_after: Option<Duration>,
    /// Delay between eviction retries and deletion checks
    pub poll_interval: Duration,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            grace_period_secs: None,
            pod_timeout: POD_EVICTION_TIMEOUT,
            skip_wait_for_delete_after: None,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl DrainOptions {
    /// Options suited to the node's health
    ///
    /// An unreachable kubelet will never confirm termination, so pods get a
    /// one second grace period and are not waited on once terminating.
    /// Disruption budgets still apply.
    pub fn for_node(node: &Node) -> Self {
        if is_unreachable(node) {
            Self {
                grace_period_secs: Some(UNREACHABLE_GRACE_PERIOD_SECS),
                skip_wait_for_delete_after: Some(UNREACHABLE_SKIP_WAIT),
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }
}

/// Outcome of a drain attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every evictable pod is gone
    Drained {
        /// Pods evicted in this pass
        evicted: usize,
    },
    /// Some pods outlasted their window
    TimedOut {
        /// `namespace/name` of the pods still present
        pods: Vec<String>,
    },
}

/// True when the node's Ready condition is Unknown
pub fn is_unreachable(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "Unknown")
        })
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.annotations().contains_key(MIRROR_POD_ANNOTATION)
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.owner_references().iter().any(|r| r.kind == "DaemonSet")
}

fn terminating_longer_than(pod: &Pod, threshold: Duration, now: DateTime<Utc>) -> bool {
    let Some(deleted_at) = pod.metadata.deletion_timestamp.as_ref() else {
        return false;
    };
    chrono::Duration::from_std(threshold)
        .map(|t| deleted_at.0 + t < now)
        .unwrap_or(false)
}

/// Pods the drain has to remove
///
/// Mirror pods belong to the kubelet and DaemonSet pods would be recreated
/// in place. Pods without an owner and pods using emptyDir are evicted
/// like any other.
pub fn pods_to_evict(pods: Vec<Pod>, options: &DrainOptions, now: DateTime<Utc>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| !is_mirror_pod(pod) && !is_daemonset_pod(pod))
        .filter(|pod| match options.skip_wait_for_delete_after {
            Some(threshold) => !terminating_longer_than(pod, threshold, now),
            None => true,
        })
        .collect()
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Evict every evictable pod on `node` and wait for them to go
pub async fn drain_node(
    client: &dyn DrainClient,
    node: &str,
    options: &DrainOptions,
) -> Result<DrainOutcome, Error> {
    let pods = client.list_pods_on_node(node).await?;
    let targets = pods_to_evict(pods, options, Utc::now());
    if targets.is_empty() {
        debug!(node, "no pods to evict");
        return Ok(DrainOutcome::Drained { evicted: 0 });
    }

    info!(node, pods = targets.len(), "evicting pods");
    let results = join_all(
        targets
            .iter()
            .map(|pod| evict_and_wait(client, pod, options)),
    )
    .await;

    let mut evicted = 0;
    let mut remaining = Vec::new();
    for (pod, result) in targets.iter().zip(results) {
        if result? {
            evicted += 1;
        } else {
            remaining.push(pod_key(pod));
        }
    }

    if remaining.is_empty() {
        Ok(DrainOutcome::Drained { evicted })
    } else {
        warn!(node, pods = ?remaining, "pods did not leave within the eviction window");
        Ok(DrainOutcome::TimedOut { pods: remaining })
    }
}

/// Evict one pod and wait for it to disappear; false on timeout
async fn evict_and_wait(
    client: &dyn DrainClient,
    pod: &Pod,
    options: &DrainOptions,
) -> Result<bool, Error> {
    let namespace = pod.namespace().unwrap_or_default();
    let name = pod.name_any();
    let deadline = Instant::now() + options.pod_timeout;

    loop {
        match client
            .evict_pod(&namespace, &name, options.grace_period_secs)
            .await?
        {
            EvictionResult::Gone => return Ok(true),
            EvictionResult::Evicted => break,
            EvictionResult::Blocked(reason) => {
                if Instant::now() + options.poll_interval > deadline {
                    return Ok(false);
                }
                debug!(pod = %pod_key(pod), %reason, "eviction blocked by disruption budget");
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    }

    let uid = pod.uid();
    loop {
        match client.get_pod(&namespace, &name).await? {
            None => return Ok(true),
            Some(current) if current.uid() != uid => return Ok(true),
            Some(current)
                if options.skip_wait_for_delete_after.is_some_and(|threshold| {
                    terminating_longer_than(&current, threshold, Utc::now())
                }) =>
            {
                return Ok(true)
            }
            Some(_) => {
                if Instant::now() + options.poll_interval > deadline {
                    return Ok(false);
                }
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn owned_by(mut p: Pod, kind: &str) -> Pod {
        p.metadata.owner_references = Some(vec![OwnerReference {
            kind: kind.to_string(),
            name: "owner".to_string(),
            api_version: "apps/v1".to_string(),
            uid: "owner-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        p
    }

    fn node_with_ready(status: &str) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    mod selection {
        use super::*;

        #[test]
        fn mirror_and_daemonset_pods_stay() {
            let mut mirror = pod("kube-apiserver");
            mirror.metadata.annotations = Some(BTreeMap::from([(
                MIRROR_POD_ANNOTATION.to_string(),
                "hash".to_string(),
            )]));
            let pods = vec![
                mirror,
                owned_by(pod("node-exporter"), "DaemonSet"),
                owned_by(pod("web"), "ReplicaSet"),
                pod("bare"),
            ];

            let names: Vec<String> = pods_to_evict(pods, &DrainOptions::default(), Utc::now())
                .iter()
                .map(|p| p.name_any())
                .collect();
            assert_eq!(names, vec!["web", "bare"]);
        }

        #[test]
        fn long_terminating_pods_are_skipped_on_unreachable_nodes() {
            let mut stuck = pod("stuck");
            stuck.metadata.deletion_timestamp =
                Some(Time(Utc::now() - chrono::Duration::minutes(5)));
            let options = DrainOptions::for_node(&node_with_ready("Unknown"));

            assert!(pods_to_evict(vec![stuck.clone()], &options, Utc::now()).is_empty());
            assert_eq!(
                pods_to_evict(vec![stuck], &DrainOptions::default(), Utc::now()).len(),
                1
            );
        }

        #[test]
        fn unreachable_nodes_get_short_grace() {
            let options = DrainOptions::for_node(&node_with_ready("Unknown"));
            assert_eq!(options.grace_period_secs, Some(1));
            assert_eq!(options.pod_timeout, POD_EVICTION_TIMEOUT);

            assert_eq!(
                DrainOptions::for_node(&node_with_ready("True")),
                DrainOptions::default()
            );
            assert!(!is_unreachable(&Node::default()));
        }
    }

    mod eviction {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn evicted_pods_are_awaited_until_gone() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![pod("a"), pod("b")]));
            client
                .expect_evict_pod()
                .times(2)
                .returning(|_, _, _| Ok(EvictionResult::Evicted));
            let polls = Arc::new(AtomicUsize::new(0));
            let p = polls.clone();
            client.expect_get_pod().returning(move |_, name| {
                // each pod is still there on the first check
                if p.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Some(pod(name)))
                } else {
                    Ok(None)
                }
            });

            let outcome = drain_node(&client, "node-a", &DrainOptions::default())
                .await
                .unwrap();
            assert_eq!(outcome, DrainOutcome::Drained { evicted: 2 });
        }

        #[tokio::test(start_paused = true)]
        async fn disruption_budget_that_never_yields_times_out() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![owned_by(pod("db-0"), "StatefulSet")]));
            client.expect_evict_pod().returning(|_, _, _| {
                Ok(EvictionResult::Blocked(
                    "Cannot evict pod as it would violate the pod's disruption budget".into(),
                ))
            });
            client.expect_get_pod().never();

            let started = Instant::now();
            let outcome = drain_node(&client, "node-a", &DrainOptions::default())
                .await
                .unwrap();

            assert_eq!(
                outcome,
                DrainOutcome::TimedOut {
                    pods: vec!["default/db-0".to_string()]
                }
            );
            assert!(started.elapsed() <= POD_EVICTION_TIMEOUT);
        }

        #[tokio::test(start_paused = true)]
        async fn budget_that_frees_up_lets_the_drain_finish() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![pod("web")]));
            let attempts = Arc::new(AtomicUsize::new(0));
            let a = attempts.clone();
            client.expect_evict_pod().returning(move |_, _, _| {
                if a.fetch_add(1, Ordering::SeqCst) < 3 {
                    Ok(EvictionResult::Blocked("budget".into()))
                } else {
                    Ok(EvictionResult::Evicted)
                }
            });
            client.expect_get_pod().returning(|_, _| Ok(None));

            let outcome = drain_node(&client, "node-a", &DrainOptions::default())
                .await
                .unwrap();
            assert_eq!(outcome, DrainOutcome::Drained { evicted: 1 });
            assert_eq!(attempts.load(Ordering::SeqCst), 4);
        }

        #[tokio::test(start_paused = true)]
        async fn recreated_pod_with_same_name_counts_as_gone() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![pod("db-0")]));
            client
                .expect_evict_pod()
                .returning(|_, _, _| Ok(EvictionResult::Evicted));
            client.expect_get_pod().returning(|_, name| {
                let mut replacement = pod(name);
                replacement.metadata.uid = Some("new-uid".to_string());
                Ok(Some(replacement))
            });

            let outcome = drain_node(&client, "node-a", &DrainOptions::default())
                .await
                .unwrap();
            assert_eq!(outcome, DrainOutcome::Drained { evicted: 1 });
        }

        #[tokio::test(start_paused = true)]
        async fn unreachable_node_does_not_wait_on_terminating_pods() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![pod("web")]));
            client
                .expect_evict_pod()
                .withf(|_, _, grace| *grace == Some(1))
                .returning(|_, _, _| Ok(EvictionResult::Evicted));
            client.expect_get_pod().returning(|_, name| {
                let mut terminating = pod(name);
                terminating.metadata.deletion_timestamp =
                    Some(Time(Utc::now() - chrono::Duration::seconds(10)));
                Ok(Some(terminating))
            });

            let options = DrainOptions::for_node(&node_with_ready("Unknown"));
            let outcome = drain_node(&client, "node-a", &options).await.unwrap();
            assert_eq!(outcome, DrainOutcome::Drained { evicted: 1 });
        }

        #[tokio::test]
        async fn eviction_errors_fail_the_drain() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![pod("web")]));
            client
                .expect_evict_pod()
                .returning(|_, _, _| Err(Error::drain("node-a", "forbidden")));

            let err = drain_node(&client, "node-a", &DrainOptions::default())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("forbidden"));
        }

        #[tokio::test]
        async fn empty_node_drains_immediately() {
            let mut client = MockDrainClient::new();
            client
                .expect_list_pods_on_node()
                .returning(|_| Ok(vec![owned_by(pod("ds"), "DaemonSet")]));
            client.expect_evict_pod().never();

            let outcome = drain_node(&client, "node-a", &DrainOptions::default())
                .await
                .unwrap();
            assert_eq!(outcome, DrainOutcome::Drained { evicted: 0 });
        }
    }
}
