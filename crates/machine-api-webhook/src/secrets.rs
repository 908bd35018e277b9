//! Secret existence lookups for credentials warnings

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use machine_api_common::Error;

/// Answers whether a Secret exists
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretLookup: Send + Sync {
    /// True when `namespace/name` exists
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// [`SecretLookup`] backed by the API server
pub struct KubeSecretLookup {
    client: Client,
}

impl KubeSecretLookup {
    /// Create a lookup over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretLookup for KubeSecretLookup {
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }
}
