//! kubelink transport: MQTT publishing and broker connection options.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS, TlsConfiguration, Transport};
use tracing::debug;

#[cfg(any(test, feature = "fake"))]
pub mod fake;

pub const DEFAULT_CLIENT_ID: &str = "kubelink";
pub const DEFAULT_PORT: u16 = 1883;
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },
    #[error("TLS enabled but no CA bundle configured")]
    MissingCa,
    #[error("reading CA bundle {path}: {source}")]
    Ca { path: PathBuf, source: std::io::Error },
}

/// Fire-and-forget message sink (QoS 0, not retained).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;
}

/// [`Publisher`] over a rumqttc client handle; the event loop is driven elsewhere.
///
/// Publishing never waits on the request queue: when the event loop is not
/// draining it (broker outage, shutdown) the message is dropped with an error.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self { Self { client } }
    pub fn client(&self) -> &AsyncClient { &self.client }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        debug!(topic = %topic, bytes = payload.len(), "publish");
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.into_bytes())
            .map_err(|e| TransportError::Publish { topic: topic.to_string(), message: e.to_string() })
    }
}

/// Broker connection settings as read from configuration.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: None,
            password: None,
            use_tls: false,
            ca_path: None,
        }
    }

    /// Build rumqttc options; with TLS on, the CA bundle is read here.
    pub fn to_options(&self) -> Result<MqttOptions, TransportError> {
        let mut opts = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        opts.set_keep_alive(KEEP_ALIVE);
        opts.set_clean_session(true);
        if let Some(user) = self.username.as_deref().filter(|u| !u.is_empty()) {
            opts.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        if self.use_tls {
            let path = self.ca_path.clone().ok_or(TransportError::MissingCa)?;
            let ca = std::fs::read(&path).map_err(|source| TransportError::Ca { path, source })?;
            opts.set_transport(Transport::tls_with_config(TlsConfiguration::Simple { ca, alpn: None, client_auth: None }));
        }
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_request_queue_fails_fast() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("t", "127.0.0.1", 1), 2);
        let publisher = MqttPublisher::new(client);
        let flood = async {
            let mut failed = 0;
            for i in 0..5 {
                if publisher.publish("/t/attrs", format!("m{}", i)).await.is_err() {
                    failed += 1;
                }
            }
            failed
        };
        let failed = tokio::time::timeout(Duration::from_secs(2), flood).await.unwrap();
        assert_eq!(failed, 3);
    }

    #[test]
    fn plain_options() {
        let mut s = MqttSettings::new("broker.local");
        s.port = 8883;
        let opts = s.to_options().unwrap();
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 8883));
        assert_eq!(opts.client_id(), DEFAULT_CLIENT_ID);
        assert_eq!(opts.keep_alive(), KEEP_ALIVE);
        assert!(opts.clean_session());
        assert!(opts.credentials().is_none());
        assert!(matches!(opts.transport(), Transport::Tcp));
    }

    #[test]
    fn credentials_only_with_username() {
        let mut s = MqttSettings::new("b");
        s.password = Some("secret".into());
        assert!(s.to_options().unwrap().credentials().is_none());
        s.username = Some("dev".into());
        assert_eq!(s.to_options().unwrap().credentials(), Some(("dev".to_string(), "secret".to_string())));
    }

    #[test]
    fn tls_requires_a_readable_ca() {
        let mut s = MqttSettings::new("b");
        s.use_tls = true;
        assert!(matches!(s.to_options(), Err(TransportError::MissingCa)));
        s.ca_path = Some(PathBuf::from("/nonexistent/kubelink/ca.pem"));
        assert!(matches!(s.to_options(), Err(TransportError::Ca { .. })));

        let path = std::env::temp_dir().join(format!("kubelink-ca-{}.pem", std::process::id()));
        std::fs::write(&path, b"-----BEGIN CERTIFICATE-----\n").unwrap();
        s.ca_path = Some(path.clone());
        let opts = s.to_options().unwrap();
        assert!(matches!(opts.transport(), Transport::Tls(_)));
        let _ = std::fs::remove_file(path);
    }
}
