//! kubelink core types: managed kinds, topic naming and manifest decoding.

#![forbid(unsafe_code)]

pub mod manifest;

pub use manifest::{decode_manifest, DecodeError, Manifest};

/// Namespace every command and every report operates in.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Resource kinds accepted on the command topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagedKind {
    Deployment,
    Service,
    ConfigMap,
    Secret,
}

impl ManagedKind {
    pub const ALL: [ManagedKind; 4] = [
        ManagedKind::Deployment,
        ManagedKind::Service,
        ManagedKind::ConfigMap,
        ManagedKind::Secret,
    ];

    pub fn api_version(self) -> &'static str {
        match self {
            ManagedKind::Deployment => "apps/v1",
            ManagedKind::Service | ManagedKind::ConfigMap | ManagedKind::Secret => "v1",
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            ManagedKind::Deployment => "Deployment",
            ManagedKind::Service => "Service",
            ManagedKind::ConfigMap => "ConfigMap",
            ManagedKind::Secret => "Secret",
        }
    }

    /// Lowercase label used in reply texts, log fields and metric labels.
    pub fn label(self) -> &'static str {
        match self {
            ManagedKind::Deployment => "deployment",
            ManagedKind::Service => "service",
            ManagedKind::ConfigMap => "configmap",
            ManagedKind::Secret => "secret",
        }
    }

    /// Resolve an `apiVersion`/`kind` pair; anything but the four exact pairs is unmanaged.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.api_version() == api_version && k.kind() == kind)
    }
}

impl std::fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// Default command topic base for a device: `/<deviceType>/<deviceID>`.
pub fn default_cmd_base(device_type: &str, device_id: &str) -> String {
    format!("/{}/{}", device_type, device_id)
}

/// Topic the router subscribes to.
pub fn cmd_topic(base: &str) -> String {
    format!("{}/cmd", base)
}

/// Topic replies are published on.
pub fn reply_topic(base: &str) -> String {
    format!("{}/cmdexe", base)
}

/// Topic state reporters publish attribute lines on.
pub fn attrs_topic(device_type: &str, device_id: &str) -> String {
    format!("/{}/{}/attrs", device_type, device_id)
}
