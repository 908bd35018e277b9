//! Leader election using Kubernetes Leases
//!
//! Only the leader runs reconcilers. Uses the coordination.k8s.io/v1
//! Lease API with resourceVersion compare-and-swap: if the lease changes
//! between read and write the update fails with 409 Conflict and we retry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default lease duration, matching controller-runtime's default
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(137);

const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const FIELD_MANAGER: &str = "machine-api-controllers";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease object is malformed
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create a new leader elector with the default lease duration
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: renew_interval_for(DEFAULT_LEASE_DURATION),
            retry_interval: retry_interval_for(DEFAULT_LEASE_DURATION),
        }
    }

    /// Override the lease duration; renew and retry intervals follow it
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self.renew_interval = renew_interval_for(lease_duration);
        self.retry_interval = retry_interval_for(lease_duration);
        self
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease. `LeaderGuard::lost` resolves
    /// when a renewal fails.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard, LeaderElectionError> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let Some(lease) = existing else {
            return self.create_lease(&api, now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_ref());
        if holder == Some(&self.identity) {
            return self.write_lease(&api, &lease, now, false).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let expired = match (renew_time, duration_secs) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
            _ => true,
        };

        if expired {
            self.write_lease(&api, &lease, now, true).await
        } else {
            Ok(false)
        }
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew a lease we hold, or take over an expired one
    ///
    /// The write carries the resourceVersion that was read, so a concurrent
    /// writer makes it fail with 409.
    async fn write_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
        take_over: bool,
    ) -> Result<bool, LeaderElectionError> {
        if existing.metadata.resource_version.is_none() {
            return Err(LeaderElectionError::MissingResourceVersion(
                self.lease_name.clone(),
            ));
        }

        let mut updated = existing.clone();
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(self.lease_duration.as_secs() as i32);
        if take_over {
            spec.holder_identity = Some(self.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }

        match api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                if take_over {
                    info!(identity = %self.identity, "Took over expired lease");
                } else {
                    debug!(identity = %self.identity, "Lease renewed");
                }
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, take_over, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(self.lease_duration.as_secs() as i64);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past)
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

fn renew_interval_for(lease_duration: Duration) -> Duration {
    (lease_duration / 3).max(MIN_RETRY_INTERVAL)
}

fn retry_interval_for(lease_duration: Duration) -> Duration {
    (lease_duration / 5).max(MIN_RETRY_INTERVAL)
}

/// Guard that maintains leadership while it is alive
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Release leadership during graceful shutdown
    pub async fn release(&self) -> Result<(), LeaderElectionError> {
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_scale_with_lease_duration() {
        assert_eq!(
            renew_interval_for(Duration::from_secs(137)),
            Duration::from_secs(137) / 3
        );
        assert_eq!(
            retry_interval_for(Duration::from_secs(30)),
            Duration::from_secs(6)
        );
    }

    #[test]
    fn intervals_have_a_floor() {
        assert_eq!(renew_interval_for(Duration::from_secs(3)), MIN_RETRY_INTERVAL);
        assert_eq!(retry_interval_for(Duration::from_secs(1)), MIN_RETRY_INTERVAL);
    }
}
