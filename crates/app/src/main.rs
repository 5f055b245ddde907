//! kubelink: apply Kubernetes manifests received over MQTT and report cluster state back.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Result;
use clap::Parser;

mod config;
mod supervisor;

use config::Config;

fn init_tracing(directive: &str) {
    let filter = tracing_subscriber::EnvFilter::from_str(directive).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    if let Some(sock) = addr {
        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        match builder.with_http_listener(sock).install() {
            Ok(_) => tracing::info!(addr = %sock, "Prometheus metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_tracing(&cfg.log_level);
    init_metrics(cfg.metrics_addr);
    if let Err(e) = supervisor::run(cfg).await {
        tracing::error!(error = ?e, "kubelink failed");
        return Err(e);
    }
    Ok(())
}
