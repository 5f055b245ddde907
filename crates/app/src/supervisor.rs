//! Wires the cluster client, MQTT session, router and reporters together and
//! owns the shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::Client;
use kubelink_apply::{ResourceReconciler, RetryConfig};
use kubelink_kubehub::KubeApi;
use kubelink_report::{DeploymentState, PodState, StateReporter};
use kubelink_router::{CommandRouter, Reconcilers};
use kubelink_transport::{MqttPublisher, Publisher};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing, Packet, Publish, QoS};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;

const REQUEST_CAP: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const DRAIN_RETRY: Duration = Duration::from_millis(100);

pub async fn run(cfg: Config) -> Result<()> {
    cfg.validate()?;
    let kube = kubelink_kubehub::connect(cfg.kube_conf_path.as_deref()).await?;
    let options = cfg.mqtt_settings().to_options().context("building MQTT options")?;
    let (mqtt, mut eventloop) = AsyncClient::new(options, REQUEST_CAP);
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(mqtt.clone()));

    let router = Arc::new(CommandRouter::new(reconcilers(&kube), &cfg.cmd_base(), cfg.reply_delay(), publisher.clone()));
    let mut reporters = reporters(&cfg, &kube, &publisher);
    info!(
        broker = %format!("{}:{}", cfg.mqtt_host, cfg.mqtt_port),
        cmd_topic = router.cmd_topic(),
        reply_topic = router.reply_topic(),
        reporters = reporters.len(),
        "kubelink starting"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut session = Session::new(router.cmd_topic());
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            ev = eventloop.poll() => match session.step(&ev) {
                Step::Subscribe { first } => {
                    resubscribe(&mqtt, router.cmd_topic());
                    if first {
                        start_reporters(&mut reporters);
                    }
                }
                Step::Command(msg) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(e) = router.handle(&msg.payload).await {
                            error!(error = %e, "command reply not delivered");
                        }
                    });
                }
                Step::Ignore => {}
                Step::Reconnect(e) => {
                    warn!(error = %e, "MQTT connection lost, reconnecting");
                    tokio::time::sleep(RECONNECT_PAUSE).await;
                }
                Step::Fatal(e) => return Err(anyhow!("connecting to MQTT broker: {}", e)),
            }
        }
    }

    drain(&mut reporters, &mqtt, &mut eventloop).await;
    info!("kubelink stopped");
    Ok(())
}

/// What the supervisor does with one event loop result.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    /// (Re)subscribe to the command topic; `first` also starts the reporters.
    Subscribe { first: bool },
    Command(Publish),
    Ignore,
    Reconnect(String),
    Fatal(String),
}

struct Session {
    cmd_topic: String,
    connected: bool,
}

impl Session {
    fn new(cmd_topic: &str) -> Self {
        Self { cmd_topic: cmd_topic.to_string(), connected: false }
    }

    fn step(&mut self, ev: &Result<Event, ConnectionError>) -> Step {
        match ev {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, session_present = ack.session_present, "connected to broker");
                let first = !self.connected;
                self.connected = true;
                Step::Subscribe { first }
            }
            Ok(Event::Incoming(Packet::Publish(msg))) if msg.topic == self.cmd_topic => Step::Command(msg.clone()),
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                debug!(topic = %msg.topic, "ignoring message on foreign topic");
                Step::Ignore
            }
            Ok(_) => Step::Ignore,
            // a broker that never accepted us is a configuration problem
            Err(e) if !self.connected => Step::Fatal(e.to_string()),
            Err(e) => Step::Reconnect(e.to_string()),
        }
    }
}

/// Queue the subscription off the event loop task; the request may sit behind
/// publishes queued while the broker was away, and only `poll` drains them.
fn resubscribe(mqtt: &AsyncClient, topic: &str) -> JoinHandle<()> {
    let mqtt = mqtt.clone();
    let topic = topic.to_string();
    tokio::spawn(async move {
        match mqtt.subscribe(topic.clone(), QoS::AtMostOnce).await {
            Ok(()) => debug!(topic = %topic, "subscribe queued"),
            Err(e) => error!(topic = %topic, error = %e, "subscribe failed"),
        }
    })
}

fn start_reporters(reporters: &mut [StateReporter]) {
    for r in reporters.iter_mut() {
        match r.start() {
            Ok(()) => info!(reporter = r.name(), topic = r.topic(), "reporter running"),
            Err(e) => warn!(error = %e, "reporter not started"),
        }
    }
}

/// Stop every reporter, then disconnect. The event loop keeps turning while
/// reporters finish so a cycle's queued publishes cannot hold up the stop.
async fn drain(reporters: &mut [StateReporter], mqtt: &AsyncClient, eventloop: &mut EventLoop) {
    {
        let stop_all = async {
            for r in reporters.iter_mut() {
                r.shutdown().await;
            }
        };
        tokio::pin!(stop_all);
        loop {
            tokio::select! {
                _ = &mut stop_all => break,
                ev = eventloop.poll() => {
                    if let Err(e) = ev {
                        debug!(error = %e, "event loop error while draining");
                        tokio::time::sleep(DRAIN_RETRY).await;
                    }
                }
            }
        }
    }
    disconnect(mqtt, eventloop).await;
}

fn reconcilers(kube: &Client) -> Reconcilers {
    let retry = RetryConfig::default();
    Reconcilers {
        deployments: ResourceReconciler::new(Arc::new(KubeApi::<Deployment>::new(kube.clone())), retry.clone()),
        services: ResourceReconciler::new(Arc::new(KubeApi::<Service>::new(kube.clone())), retry.clone()),
        config_maps: ResourceReconciler::new(Arc::new(KubeApi::<ConfigMap>::new(kube.clone())), retry.clone()),
        secrets: ResourceReconciler::new(Arc::new(KubeApi::<Secret>::new(kube.clone())), retry),
    }
}

fn reporters(cfg: &Config, kube: &Client, publisher: &Arc<dyn Publisher>) -> Vec<StateReporter> {
    let mut out = Vec::new();
    if cfg.use_pod_state_reporter {
        let report = PodState::new(Arc::new(KubeApi::<Pod>::new(kube.clone())), publisher.clone(), cfg.label_key());
        out.push(StateReporter::new(Arc::new(report), cfg.attrs_topic(), cfg.report_interval()));
    }
    if cfg.use_deployment_state_reporter {
        let report = DeploymentState::new(Arc::new(KubeApi::<Deployment>::new(kube.clone())), publisher.clone(), cfg.label_key());
        out.push(StateReporter::new(Arc::new(report), cfg.attrs_topic(), cfg.report_interval()));
    }
    out
}

/// Queue a DISCONNECT and keep the event loop turning until it is on the wire.
async fn disconnect(mqtt: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = mqtt.try_disconnect() {
        warn!(error = %e, "disconnect request failed");
        return;
    }
    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
        warn!("broker disconnect timed out");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = ?e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::{Error as IoError, ErrorKind};

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubelink_kubehub::fake::FakeCluster;
    use rumqttc::{ConnAck, ConnectReturnCode, MqttOptions};

    use super::*;

    const CMD: &str = "/edge/dev-1/cmd";

    fn connack() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck { session_present: false, code: ConnectReturnCode::Success })))
    }

    fn message(topic: &str) -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::Publish(Publish::new(topic, QoS::AtMostOnce, "1@apply|x"))))
    }

    fn refused() -> Result<Event, ConnectionError> {
        Err(ConnectionError::Io(IoError::new(ErrorKind::ConnectionRefused, "refused")))
    }

    // nothing listens on port 1 and the event loop is driven by the test, if at all
    fn unreachable(cap: usize) -> (AsyncClient, EventLoop) {
        AsyncClient::new(MqttOptions::new("kubelink-test", "127.0.0.1", 1), cap)
    }

    #[test]
    fn every_connack_resubscribes_and_only_the_first_starts_reporters() {
        let mut s = Session::new(CMD);
        assert_eq!(s.step(&connack()), Step::Subscribe { first: true });
        assert_eq!(s.step(&connack()), Step::Subscribe { first: false });
    }

    #[test]
    fn only_command_topic_messages_are_dispatched() {
        let mut s = Session::new(CMD);
        s.step(&connack());
        match s.step(&message(CMD)) {
            Step::Command(p) => assert_eq!(&p.payload[..], b"1@apply|x"),
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(s.step(&message("/edge/dev-1/cmdexe")), Step::Ignore);
        assert_eq!(s.step(&Ok(Event::Outgoing(Outgoing::PingReq))), Step::Ignore);
    }

    #[test]
    fn connection_errors_are_fatal_until_the_first_connack() {
        let mut s = Session::new(CMD);
        assert!(matches!(s.step(&refused()), Step::Fatal(_)));
        s.step(&connack());
        assert!(matches!(s.step(&refused()), Step::Reconnect(_)));
        assert!(matches!(s.step(&refused()), Step::Reconnect(_)));
        assert_eq!(s.step(&connack()), Step::Subscribe { first: false });
    }

    #[tokio::test]
    async fn resubscribe_does_not_wait_on_a_full_request_queue() {
        let (mqtt, _eventloop) = unreachable(2);
        while mqtt.try_publish("/edge/dev-1/attrs", QoS::AtMostOnce, false, "x").is_ok() {}

        let handle = tokio::time::timeout(Duration::from_millis(100), async { resubscribe(&mqtt, CMD) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn drain_finishes_while_reporters_flood_the_request_queue() {
        let pods = (0..100).map(|i| Pod {
            metadata: ObjectMeta {
                name: Some(format!("pod-{}", i)),
                labels: Some(BTreeMap::from([("app".to_string(), "edge".to_string())])),
                ..Default::default()
            },
            ..Default::default()
        });
        let cluster = Arc::new(FakeCluster::new().with_objects(pods));
        let (mqtt, mut eventloop) = unreachable(REQUEST_CAP);
        let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(mqtt.clone()));
        let report = PodState::new(cluster, publisher, Some("app".into()));
        let mut reporters = vec![StateReporter::new(Arc::new(report), "/edge/dev-1/attrs", Duration::from_millis(100))];
        start_reporters(&mut reporters);
        tokio::time::sleep(Duration::from_millis(250)).await;

        tokio::time::timeout(Duration::from_secs(10), drain(&mut reporters, &mqtt, &mut eventloop))
            .await
            .expect("drain stalled");
        assert!(reporters[0].stop_sender().send(true).await.is_err());
    }
}
