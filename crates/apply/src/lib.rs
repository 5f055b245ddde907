//! kubelink apply: converge stored objects toward desired ones, or remove them.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::Resource;
use kubelink_core::ManagedKind;
use kubelink_kubehub::{ApiError, ClusterApi, Propagation};
use metrics::{counter, histogram};
use tracing::{error, info};

pub mod retry;

pub use retry::{retry_on_conflict, RetryConfig};

/// Per-kind merge rules. Everything not copied here (resourceVersion, uid,
/// status, server defaults) stays as the server returned it.
pub trait Reconcilable: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    const KIND: ManagedKind;

    fn merge_desired(current: &mut Self, desired: &Self);
}

fn merge_meta<K: Resource>(current: &mut K, desired: &K) {
    let meta = current.meta_mut();
    meta.labels = desired.meta().labels.clone();
    meta.annotations = desired.meta().annotations.clone();
}

impl Reconcilable for Deployment {
    const KIND: ManagedKind = ManagedKind::Deployment;

    fn merge_desired(current: &mut Self, desired: &Self) {
        merge_meta(current, desired);
        current.spec = desired.spec.clone();
    }
}

impl Reconcilable for Service {
    const KIND: ManagedKind = ManagedKind::Service;

    fn merge_desired(current: &mut Self, desired: &Self) {
        merge_meta(current, desired);
        let mut spec = desired.spec.clone();
        // clusterIP(s) are immutable once allocated
        if let (Some(spec), Some(live)) = (spec.as_mut(), current.spec.as_ref()) {
            if spec.cluster_ip.is_none() { spec.cluster_ip = live.cluster_ip.clone(); }
            if spec.cluster_ips.is_none() { spec.cluster_ips = live.cluster_ips.clone(); }
        }
        current.spec = spec;
    }
}

impl Reconcilable for ConfigMap {
    const KIND: ManagedKind = ManagedKind::ConfigMap;

    fn merge_desired(current: &mut Self, desired: &Self) {
        merge_meta(current, desired);
        current.data = desired.data.clone();
        current.binary_data = desired.binary_data.clone();
    }
}

impl Reconcilable for Secret {
    const KIND: ManagedKind = ManagedKind::Secret;

    fn merge_desired(current: &mut Self, desired: &Self) {
        merge_meta(current, desired);
        current.type_ = desired.type_.clone();
        current.data = desired.data.clone();
        current.string_data = desired.string_data.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    CreateFailed,
    Updated,
    UpdateFailed,
    Deleted,
    DeleteFailed,
    /// Delete of an object that is already gone.
    Absent,
    FetchFailed,
}

impl Outcome {
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::CreateFailed | Outcome::UpdateFailed | Outcome::DeleteFailed | Outcome::FetchFailed)
    }

    fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::CreateFailed => "create_failed",
            Outcome::Updated => "updated",
            Outcome::UpdateFailed => "update_failed",
            Outcome::Deleted => "deleted",
            Outcome::DeleteFailed => "delete_failed",
            Outcome::Absent => "absent",
            Outcome::FetchFailed => "fetch_failed",
        }
    }
}

/// Result of one apply/delete. `Display` renders the reply text sent back over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub kind: ManagedKind,
    pub name: String,
    pub outcome: Outcome,
}

impl fmt::Display for Reconciled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, name) = (self.kind.label(), &self.name);
        match self.outcome {
            Outcome::Created => write!(f, "create {} -- {}", kind, name),
            Outcome::CreateFailed => write!(f, "create {} err -- {}", kind, name),
            Outcome::Updated => write!(f, "update {} -- {}", kind, name),
            Outcome::UpdateFailed => write!(f, "update {} err -- {}", kind, name),
            Outcome::Deleted => write!(f, "delete {} -- {}", kind, name),
            Outcome::DeleteFailed => write!(f, "delete {} err -- {}", kind, name),
            Outcome::Absent => write!(f, "{} does not exist -- {}", kind, name),
            Outcome::FetchFailed => write!(f, "get {} err -- {}", kind, name),
        }
    }
}

/// Apply/delete for one kind in the default namespace.
pub struct ResourceReconciler<K: Reconcilable> {
    api: Arc<dyn ClusterApi<K>>,
    retry: RetryConfig,
}

impl<K: Reconcilable> ResourceReconciler<K> {
    pub fn new(api: Arc<dyn ClusterApi<K>>, retry: RetryConfig) -> Self {
        Self { api, retry }
    }

    /// Update the stored object if present (conflict-retried), otherwise create it.
    pub async fn apply(&self, desired: &K) -> Reconciled {
        let t0 = std::time::Instant::now();
        let name = object_name(desired);
        let res = match self.api.get(&name).await {
            Ok(current) => match self.update(current, desired, &name).await {
                Ok(_) => self.done(name, Outcome::Updated, None),
                Err(e) => self.done(name, Outcome::UpdateFailed, Some(&e)),
            },
            Err(e) if e.is_not_found() => match self.api.create(desired).await {
                Ok(created) => {
                    let created_name = created.meta().name.clone().unwrap_or(name);
                    self.done(created_name, Outcome::Created, None)
                }
                Err(e) => self.done(name, Outcome::CreateFailed, Some(&e)),
            },
            Err(e) => self.done(name, Outcome::FetchFailed, Some(&e)),
        };
        histogram!("kubelink_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => K::KIND.label());
        res
    }

    /// Foreground-delete the stored object; an absent object is a successful no-op.
    pub async fn delete(&self, desired: &K) -> Reconciled {
        let name = object_name(desired);
        match self.api.get(&name).await {
            Ok(_) => match self.api.delete(&name, Propagation::Foreground).await {
                Ok(()) => self.done(name, Outcome::Deleted, None),
                Err(e) => self.done(name, Outcome::DeleteFailed, Some(&e)),
            },
            Err(e) if e.is_not_found() => self.done(name, Outcome::Absent, None),
            Err(e) => self.done(name, Outcome::FetchFailed, Some(&e)),
        }
    }

    /// First attempt merges onto `current`; later attempts refetch before merging.
    async fn update(&self, current: K, desired: &K, name: &str) -> Result<K, ApiError> {
        let api = &self.api;
        let mut seed = Some(current);
        let op = format!("update {}/{}", K::KIND.label(), name);
        retry_on_conflict(&self.retry, &op, || {
            let fetched = seed.take();
            async move {
                let mut obj = match fetched {
                    Some(obj) => obj,
                    None => api.get(name).await?,
                };
                K::merge_desired(&mut obj, desired);
                api.update(&obj).await
            }
        })
        .await
    }

    fn done(&self, name: String, outcome: Outcome, cause: Option<&ApiError>) -> Reconciled {
        let res = Reconciled { kind: K::KIND, name, outcome };
        counter!("kubelink_reconcile_total", 1u64, "kind" => K::KIND.label(), "outcome" => outcome.as_str());
        match cause {
            Some(e) => error!(kind = K::KIND.label(), name = %res.name, error = %e, "{}", res),
            None => info!(kind = K::KIND.label(), name = %res.name, "{}", res),
        }
        res
    }
}

fn object_name<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}
