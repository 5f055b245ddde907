//! Recording [`Publisher`] for tests.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::{Publisher, TransportError};

#[derive(Default)]
struct State {
    sent: Vec<(String, String)>,
    fail_remaining: usize,
    attempts: usize,
}

/// Records every successful `(topic, payload)`; can be armed to fail the next N publishes.
#[derive(Default)]
pub struct RecordingPublisher {
    state: Mutex<State>,
}

impl RecordingPublisher {
    pub fn new() -> Self { Self::default() }

    pub fn fail_next(&self, n: usize) { self.lock().fail_remaining = n; }
    pub fn sent(&self) -> Vec<(String, String)> { self.lock().sent.clone() }
    pub fn payloads(&self) -> Vec<String> { self.lock().sent.iter().map(|(_, p)| p.clone()).collect() }
    /// Publish calls including failed ones.
    pub fn attempts(&self) -> usize { self.lock().attempts }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        let mut st = self.lock();
        st.attempts += 1;
        if st.fail_remaining > 0 {
            st.fail_remaining -= 1;
            return Err(TransportError::Publish { topic: topic.to_string(), message: "broker unavailable".into() });
        }
        st.sent.push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn armed_failures_are_consumed_in_order() {
        let p = RecordingPublisher::new();
        p.fail_next(1);
        assert!(p.publish("/t", "a".into()).await.is_err());
        p.publish("/t", "b".into()).await.unwrap();
        assert_eq!(p.sent(), vec![("/t".to_string(), "b".to_string())]);
        assert_eq!(p.attempts(), 2);
    }
}
