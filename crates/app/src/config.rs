use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use kubelink_transport::MqttSettings;

/// Every option can also be given through its environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "kubelink", version, about = "Apply Kubernetes manifests received over MQTT and report cluster state")]
pub struct Config {
    /// tracing filter directive, e.g. "info" or "kubelink_router=debug"
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// kubeconfig file; in-cluster service account when unset
    #[arg(long = "kubeconfig", env = "KUBE_CONF_PATH")]
    pub kube_conf_path: Option<PathBuf>,

    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: String,
    #[arg(long, env = "MQTT_PORT", default_value_t = kubelink_transport::DEFAULT_PORT)]
    pub mqtt_port: u16,
    #[arg(long, env = "MQTT_USERNAME")]
    pub mqtt_username: Option<String>,
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,
    #[arg(long, env = "MQTT_USE_TLS", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub mqtt_use_tls: bool,
    /// CA bundle (PEM); required when TLS is on
    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    pub mqtt_tls_ca_path: Option<PathBuf>,
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = kubelink_transport::DEFAULT_CLIENT_ID)]
    pub mqtt_client_id: String,

    #[arg(long, env = "DEVICE_TYPE")]
    pub device_type: String,
    #[arg(long, env = "DEVICE_ID")]
    pub device_id: String,
    /// Command topic base; defaults to /<device type>/<device id>
    #[arg(long, env = "CMD_TOPIC_BASE")]
    pub cmd_topic_base: Option<String>,
    #[arg(long, env = "REPLY_DELAY_MS", default_value_t = 500)]
    pub reply_delay_ms: u64,

    #[arg(long, env = "USE_POD_STATE_REPORTER", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_pod_state_reporter: bool,
    #[arg(long, env = "USE_DEPLOYMENT_STATE_REPORTER", default_value = "false", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_deployment_state_reporter: bool,
    #[arg(long, env = "REPORT_INTERVAL_SEC", default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    pub report_interval_sec: u64,
    #[arg(long, env = "REPORT_TARGET_LABEL_KEY")]
    pub report_target_label_key: Option<String>,

    /// Prometheus exporter listen address (host:port)
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Cross-field checks clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt_use_tls && self.mqtt_tls_ca_path.is_none() {
            bail!("MQTT_USE_TLS is on but MQTT_TLS_CA_PATH is not set");
        }
        if self.device_type.is_empty() || self.device_id.is_empty() {
            bail!("DEVICE_TYPE and DEVICE_ID must not be empty");
        }
        Ok(())
    }

    pub fn cmd_base(&self) -> String {
        match self.cmd_topic_base.as_deref().filter(|b| !b.is_empty()) {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => kubelink_core::default_cmd_base(&self.device_type, &self.device_id),
        }
    }

    pub fn attrs_topic(&self) -> String { kubelink_core::attrs_topic(&self.device_type, &self.device_id) }
    pub fn reply_delay(&self) -> Duration { Duration::from_millis(self.reply_delay_ms) }
    pub fn report_interval(&self) -> Duration { Duration::from_secs(self.report_interval_sec) }

    pub fn label_key(&self) -> Option<String> {
        self.report_target_label_key.clone().filter(|k| !k.is_empty())
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id: self.mqtt_client_id.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            use_tls: self.mqtt_use_tls,
            ca_path: self.mqtt_tls_ca_path.clone(),
        }
    }
}
