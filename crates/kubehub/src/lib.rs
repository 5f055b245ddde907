//! kubelink kubehub: cluster API capability set and kube-rs wiring.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

pub use kubelink_core::DEFAULT_NAMESPACE;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

/// Cluster API failures, classified the way the reconciler branches on them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    /// Stored object changed since it was read (optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool { matches!(self, ApiError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ApiError::Conflict(_)) }
}

impl From<kube::Error> for ApiError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ApiError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "Conflict" => ApiError::Conflict(ae.message),
            kube::Error::Api(ae) => ApiError::Api { code: ae.code, reason: ae.reason, message: ae.message },
            other => ApiError::Transport(other.to_string()),
        }
    }
}

/// Deletion propagation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are removed before the owner disappears.
    Foreground,
    Background,
    Orphan,
}

impl From<Propagation> for PropagationPolicy {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// Capability set for one namespaced kind in the default namespace.
#[async_trait]
pub trait ClusterApi<K: Send + Sync>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K, ApiError>;
    async fn create(&self, obj: &K) -> Result<K, ApiError>;
    /// Replace the stored object; `obj` carries the resourceVersion it was read at.
    async fn update(&self, obj: &K) -> Result<K, ApiError>;
    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), ApiError>;
    async fn list(&self) -> Result<Vec<K>, ApiError>;
}

/// kube-rs backed [`ClusterApi`].
pub struct KubeApi<K> {
    api: Api<K>,
}

impl<K> KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    pub fn new(client: Client) -> Self {
        Self { api: Api::namespaced(client, DEFAULT_NAMESPACE) }
    }
}

#[async_trait]
impl<K> ClusterApi<K> for KubeApi<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, ApiError> {
        Ok(self.api.get(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K, ApiError> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &K) -> Result<K, ApiError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        Ok(self.api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<(), ApiError> {
        let dp = DeleteParams { propagation_policy: Some(propagation.into()), ..Default::default() };
        let res = self.api.delete(name, &dp).await?;
        debug!(name = %name, pending = res.is_left(), "delete accepted");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<K>, ApiError> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }
}

/// Build a client from an explicit kubeconfig file, or from the in-cluster service account.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => Config::incluster().context("loading in-cluster config")?,
    };
    info!(cluster_url = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{} happened", reason),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn classifies_kube_errors() {
        assert!(ApiError::from(api_err(404, "NotFound")).is_not_found());
        assert!(ApiError::from(api_err(409, "Conflict")).is_conflict());
        match ApiError::from(api_err(409, "AlreadyExists")) {
            ApiError::Api { code, reason, .. } => {
                assert_eq!(code, 409);
                assert_eq!(reason, "AlreadyExists");
            }
            other => panic!("unexpected: {}", other),
        }
        assert!(matches!(ApiError::from(api_err(500, "InternalError")), ApiError::Api { code: 500, .. }));
    }

    #[test]
    fn propagation_maps_to_kube_policy() {
        assert!(matches!(PropagationPolicy::from(Propagation::Foreground), PropagationPolicy::Foreground));
        assert!(matches!(PropagationPolicy::from(Propagation::Orphan), PropagationPolicy::Orphan));
    }
}
