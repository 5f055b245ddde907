//! Decoding of command bodies into typed resource objects.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::Resource;
use serde::de::DeserializeOwned;
use serde_json::Value as Json;

use crate::ManagedKind;

/// A decoded command body; one variant per managed kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Deployment(Deployment),
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
}

impl Manifest {
    pub fn kind(&self) -> ManagedKind {
        match self {
            Manifest::Deployment(_) => ManagedKind::Deployment,
            Manifest::Service(_) => ManagedKind::Service,
            Manifest::ConfigMap(_) => ManagedKind::ConfigMap,
            Manifest::Secret(_) => ManagedKind::Secret,
        }
    }

    pub fn name(&self) -> &str {
        let name = match self {
            Manifest::Deployment(o) => &o.metadata.name,
            Manifest::Service(o) => &o.metadata.name,
            Manifest::ConfigMap(o) => &o.metadata.name,
            Manifest::Secret(o) => &o.metadata.name,
        };
        name.as_deref().unwrap_or("")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not a document, no type metadata, or fields that do not fit the kind.
    #[error("malformed manifest: {0}")]
    Malformed(String),
    /// Well-formed object of a built-in kind this bridge does not manage.
    #[error("unsupported kind {kind} ({api_version})")]
    Unsupported { api_version: String, kind: String },
}

/// Decode a YAML or JSON manifest into one of the managed kinds.
pub fn decode_manifest(raw: &[u8]) -> Result<Manifest, DecodeError> {
    let doc: serde_yaml::Value =
        serde_yaml::from_slice(raw).map_err(|e| DecodeError::Malformed(format!("parsing document: {}", e)))?;
    let json = serde_json::to_value(doc).map_err(|e| DecodeError::Malformed(format!("converting document: {}", e)))?;

    let api_version = type_field(&json, "apiVersion")?;
    let kind = type_field(&json, "kind")?;
    let Some(managed) = ManagedKind::from_type_meta(&api_version, &kind) else {
        if !is_registered(&api_version, &kind) {
            return Err(DecodeError::Malformed(format!("no kind {} registered for {}", kind, api_version)));
        }
        return Err(DecodeError::Unsupported { api_version, kind });
    };

    match managed {
        ManagedKind::Deployment => typed(json).map(Manifest::Deployment),
        ManagedKind::Service => typed(json).map(Manifest::Service),
        ManagedKind::ConfigMap => typed(json).map(Manifest::ConfigMap),
        ManagedKind::Secret => typed(json).map(Manifest::Secret),
    }
}

macro_rules! type_metas {
    ($($t:ty),* $(,)?) => { &[$((<$t as Resource>::API_VERSION, <$t as Resource>::KIND)),*] };
}

/// Built-in types the decoder recognises; anything else cannot be decoded at all.
static REGISTERED: &[(&str, &str)] = {
    use k8s_openapi::api::{
        admissionregistration::v1 as admission, apps::v1 as apps, autoscaling::v2 as autoscaling, batch::v1 as batch,
        certificates::v1 as certificates, coordination::v1 as coordination, core::v1 as corev1,
        discovery::v1 as discovery, networking::v1 as networking, node::v1 as node, policy::v1 as policy,
        rbac::v1 as rbac, scheduling::v1 as scheduling, storage::v1 as storage,
    };
    type_metas![
        corev1::Namespace, corev1::Pod, corev1::Node, corev1::PersistentVolume, corev1::PersistentVolumeClaim,
        corev1::ServiceAccount, corev1::Endpoints, corev1::Event, corev1::LimitRange, corev1::ResourceQuota,
        corev1::ReplicationController, corev1::PodTemplate,
        apps::ReplicaSet, apps::StatefulSet, apps::DaemonSet, apps::ControllerRevision,
        batch::Job, batch::CronJob,
        autoscaling::HorizontalPodAutoscaler,
        policy::PodDisruptionBudget,
        networking::Ingress, networking::IngressClass, networking::NetworkPolicy,
        rbac::Role, rbac::RoleBinding, rbac::ClusterRole, rbac::ClusterRoleBinding,
        storage::StorageClass, storage::VolumeAttachment, storage::CSIDriver, storage::CSINode,
        coordination::Lease,
        discovery::EndpointSlice,
        node::RuntimeClass,
        scheduling::PriorityClass,
        certificates::CertificateSigningRequest,
        admission::MutatingWebhookConfiguration, admission::ValidatingWebhookConfiguration,
    ]
};

fn is_registered(api_version: &str, kind: &str) -> bool {
    REGISTERED.iter().any(|&(v, k)| v == api_version && k == kind)
}

fn type_field(json: &Json, field: &str) -> Result<String, DecodeError> {
    json.get(field)
        .and_then(Json::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DecodeError::Malformed(format!("missing {}", field)))
}

fn typed<T: DeserializeOwned>(json: Json) -> Result<T, DecodeError> {
    serde_json::from_value(json).map_err(|e| DecodeError::Malformed(format!("decoding object: {}", e)))
}
