//! Pod and Deployment state reports.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, SecondsFormat};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kubelink_kubehub::{ApiError, ClusterApi};
use kubelink_transport::Publisher;
use metrics::counter;
use tracing::{debug, error};

use crate::Report;

/// Wall-clock source for report timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> DateTime<FixedOffset> { Local::now().fixed_offset() }
}

fn timestamp(clock: &dyn Clock) -> String {
    clock.now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `<ts>|pod|<name>|label|<key>:<value>|phase|<phase>`; `None` when the pod lacks the key.
pub fn pod_line(ts: &str, pod: &Pod, key: &str) -> Option<String> {
    let value = pod.metadata.labels.as_ref()?.get(key)?;
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default();
    Some(format!("{}|pod|{}|label|{}:{}|phase|{}", ts, name, key, value, phase))
}

/// `<ts>|deployment|<name>[|label|<key>:<value>]|desired|..|available|<n>`.
pub fn deployment_line(ts: &str, deployment: &Deployment, key: Option<&str>) -> String {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let label = key
        .and_then(|k| Some((k, deployment.metadata.labels.as_ref()?.get(k)?)))
        .map(|(k, v)| format!("|label|{}:{}", k, v))
        .unwrap_or_default();
    // unset spec.replicas defaults to 1 server-side
    let desired = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();
    format!(
        "{}|deployment|{}{}|desired|{}|current|{}|updated|{}|ready|{}|unavailable|{}|available|{}",
        ts,
        name,
        label,
        desired,
        status.replicas.unwrap_or(0),
        status.updated_replicas.unwrap_or(0),
        status.ready_replicas.unwrap_or(0),
        status.unavailable_replicas.unwrap_or(0),
        status.available_replicas.unwrap_or(0),
    )
}

async fn publish_all(publisher: &dyn Publisher, reporter: &'static str, topic: &str, lines: Vec<String>) -> usize {
    let mut sent = 0;
    for line in lines {
        match publisher.publish(topic, line).await {
            Ok(()) => sent += 1,
            Err(e) => error!(reporter, topic = %topic, error = %e, "publishing state failed"),
        }
    }
    counter!("kubelink_report_published_total", sent as u64, "reporter" => reporter);
    sent
}

/// Reports pods carrying the target label key; without a key nothing is published.
pub struct PodState {
    pods: Arc<dyn ClusterApi<Pod>>,
    publisher: Arc<dyn Publisher>,
    label_key: Option<String>,
    clock: Arc<dyn Clock>,
}

impl PodState {
    pub fn new(pods: Arc<dyn ClusterApi<Pod>>, publisher: Arc<dyn Publisher>, label_key: Option<String>) -> Self {
        Self { pods, publisher, label_key, clock: Arc::new(LocalClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Report for PodState {
    fn name(&self) -> &'static str { "pod" }

    async fn report(&self, topic: &str) -> Result<usize, ApiError> {
        let pods = self.pods.list().await?;
        let Some(key) = self.label_key.as_deref() else {
            debug!(listed = pods.len(), "no target label key, nothing to report");
            return Ok(0);
        };
        let ts = timestamp(self.clock.as_ref());
        let lines = pods.iter().filter_map(|p| pod_line(&ts, p, key)).collect();
        Ok(publish_all(self.publisher.as_ref(), self.name(), topic, lines).await)
    }
}

/// Reports every deployment; the label segment appears when the key is set and present.
pub struct DeploymentState {
    deployments: Arc<dyn ClusterApi<Deployment>>,
    publisher: Arc<dyn Publisher>,
    label_key: Option<String>,
    clock: Arc<dyn Clock>,
}

impl DeploymentState {
    pub fn new(deployments: Arc<dyn ClusterApi<Deployment>>, publisher: Arc<dyn Publisher>, label_key: Option<String>) -> Self {
        Self { deployments, publisher, label_key, clock: Arc::new(LocalClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Report for DeploymentState {
    fn name(&self) -> &'static str { "deployment" }

    async fn report(&self, topic: &str) -> Result<usize, ApiError> {
        let deployments = self.deployments.list().await?;
        let ts = timestamp(self.clock.as_ref());
        let key = self.label_key.as_deref();
        let lines = deployments.iter().map(|d| deployment_line(&ts, d, key)).collect();
        Ok(publish_all(self.publisher.as_ref(), self.name(), topic, lines).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use std::collections::BTreeMap;

    #[test]
    fn utc_timestamps_use_z() {
        struct Utc0;
        impl Clock for Utc0 {
            fn now(&self) -> DateTime<FixedOffset> {
                FixedOffset::east_opt(0).and_then(|tz| tz.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).single()).unwrap()
            }
        }
        assert_eq!(timestamp(&Utc0), "2024-03-01T12:00:05Z");
    }

    #[test]
    fn pod_line_requires_key() {
        let mut pod = Pod::default();
        pod.metadata.name = Some("p".into());
        assert_eq!(pod_line("T", &pod, "app"), None);
        pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        assert_eq!(pod_line("T", &pod, "app").as_deref(), Some("T|pod|p|label|app:web|phase|"));
    }

    #[test]
    fn deployment_line_defaults() {
        let mut d = Deployment::default();
        d.metadata.name = Some("d".into());
        assert_eq!(
            deployment_line("T", &d, Some("app")),
            "T|deployment|d|desired|1|current|0|updated|0|ready|0|unavailable|0|available|0"
        );
        d.status = Some(DeploymentStatus { replicas: Some(3), unavailable_replicas: Some(1), ..Default::default() });
        d.metadata.labels = Some(BTreeMap::from([("app".to_string(), "api".to_string())]));
        assert_eq!(
            deployment_line("T", &d, Some("app")),
            "T|deployment|d|label|app:api|desired|1|current|3|updated|0|ready|0|unavailable|1|available|0"
        );
    }
}
