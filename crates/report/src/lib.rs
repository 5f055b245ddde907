//! kubelink report: periodic state reporters with a two-phase stop/finish shutdown.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kubelink_kubehub::ApiError;
use metrics::histogram;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

pub mod state;

pub use state::{Clock, DeploymentState, LocalClock, PodState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReporterError {
    #[error("reporter {0} already started")]
    AlreadyStarted(&'static str),
}

/// One reporting cycle for a kind.
#[async_trait]
pub trait Report: Send + Sync {
    /// Short name for log fields and metric labels.
    fn name(&self) -> &'static str;

    /// List and publish once; returns how many messages went out.
    /// A listing failure aborts the cycle before anything is published.
    async fn report(&self, topic: &str) -> Result<usize, ApiError>;
}

/// Drives a [`Report`] on a fixed interval until told to stop.
///
/// Shutdown is a handshake: a value on `stop` ends the loop, which then closes
/// `stop`, sends exactly one `true` on `finish` and drops its end of `finish`.
/// A reporter runs at most once.
pub struct StateReporter {
    report: Arc<dyn Report>,
    topic: String,
    interval: Duration,
    stop_tx: mpsc::Sender<bool>,
    finish_rx: mpsc::Receiver<bool>,
    // loop ends of the channels, until start()
    parts: Option<(mpsc::Receiver<bool>, mpsc::Sender<bool>)>,
}

impl StateReporter {
    pub fn new(report: Arc<dyn Report>, topic: impl Into<String>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (finish_tx, finish_rx) = mpsc::channel(1);
        Self { report, topic: topic.into(), interval, stop_tx, finish_rx, parts: Some((stop_rx, finish_tx)) }
    }

    pub fn name(&self) -> &'static str { self.report.name() }
    pub fn topic(&self) -> &str { &self.topic }
    pub fn is_started(&self) -> bool { self.parts.is_none() }

    pub fn start(&mut self) -> Result<(), ReporterError> {
        let (stop_rx, finish_tx) = self.parts.take().ok_or(ReporterError::AlreadyStarted(self.report.name()))?;
        tokio::spawn(run(self.report.clone(), self.topic.clone(), self.interval, stop_rx, finish_tx));
        Ok(())
    }

    pub fn stop_sender(&self) -> mpsc::Sender<bool> { self.stop_tx.clone() }
    pub fn finish_receiver(&mut self) -> &mut mpsc::Receiver<bool> { &mut self.finish_rx }

    /// Request a stop and wait for the loop to drain. No-op for a reporter never started.
    pub async fn shutdown(&mut self) {
        if !self.is_started() {
            return;
        }
        if self.stop_tx.send(true).await.is_err() {
            debug!(reporter = self.name(), "stop channel already closed");
        }
        match self.finish_rx.recv().await {
            Some(_) => info!(reporter = self.name(), "reporter drained"),
            None => debug!(reporter = self.name(), "finish channel already closed"),
        }
    }
}

async fn run(
    report: Arc<dyn Report>,
    topic: String,
    interval: Duration,
    mut stop_rx: mpsc::Receiver<bool>,
    finish_tx: mpsc::Sender<bool>,
) {
    let name = report.name();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(reporter = name, topic = %topic, interval_ms = interval.as_millis() as u64, "reporter started");
    loop {
        tokio::select! {
            biased;
            sig = stop_rx.recv() => {
                debug!(reporter = name, closed = sig.is_none(), "stop requested");
                break;
            }
            _ = ticker.tick() => {
                let t0 = std::time::Instant::now();
                match report.report(&topic).await {
                    Ok(n) => debug!(reporter = name, published = n, "report cycle"),
                    Err(e) => error!(reporter = name, error = %e, "listing failed, cycle skipped"),
                }
                histogram!("kubelink_report_cycle_ms", t0.elapsed().as_secs_f64() * 1000.0, "reporter" => name);
            }
        }
    }
    stop_rx.close();
    if finish_tx.send(true).await.is_err() {
        debug!(reporter = name, "finish receiver already gone");
    }
    info!(reporter = name, "reporter stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Report for Counting {
        fn name(&self) -> &'static str { "counting" }
        async fn report(&self, _topic: &str) -> Result<usize, ApiError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_yields_one_finish_then_closes() {
        let mut r = StateReporter::new(Arc::new(Counting::default()), "/t/1/attrs", Duration::from_secs(1));
        r.start().unwrap();
        r.stop_sender().send(true).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), r.finish_receiver().recv()).await.unwrap();
        assert_eq!(got, Some(true));
        assert_eq!(r.finish_receiver().recv().await, None);
        assert!(r.stop_sender().send(true).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_start_one_interval_after_start() {
        let report = Arc::new(Counting::default());
        let mut r = StateReporter::new(report.clone(), "/t/1/attrs", Duration::from_secs(2));
        r.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(report.0.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(4200)).await;
        assert_eq!(report.0.load(Ordering::SeqCst), 3);
        r.shutdown().await;
    }

    #[tokio::test]
    async fn never_restarted() {
        let mut r = StateReporter::new(Arc::new(Counting::default()), "/t/1/attrs", Duration::from_secs(1));
        r.start().unwrap();
        assert_eq!(r.start(), Err(ReporterError::AlreadyStarted("counting")));
        r.shutdown().await;
        assert!(r.start().is_err());
        // a second shutdown sees both channels closed and returns
        r.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_reporter_loop_exits() {
        let report = Arc::new(Counting::default());
        let mut r = StateReporter::new(report.clone(), "/t/1/attrs", Duration::from_secs(1));
        r.start().unwrap();
        drop(r);
        let exited = async {
            while Arc::strong_count(&report) > 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), exited).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_of_unstarted_reporter_returns() {
        let mut r = StateReporter::new(Arc::new(Counting::default()), "/t/1/attrs", Duration::from_secs(1));
        r.shutdown().await;
        assert!(!r.is_started());
    }
}
