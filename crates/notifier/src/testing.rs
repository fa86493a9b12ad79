//! Test doubles for the mail gateway.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::transport::{MailTransport, TransportError};

/// Transport that succeeds or fails according to a script, then falls back
/// to a fixed answer. Records every accepted email.
#[derive(Debug)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    accepted: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
        }
    }

    pub fn always_ok() -> Self {
        Self::new([], true)
    }

    pub fn always_failing() -> Self {
        Self::new([], false)
    }

    /// Fail the first `failures` calls, then succeed.
    pub fn failing_times(failures: usize) -> Self {
        Self::new(std::iter::repeat_n(false, failures), true)
    }

    /// Hold every call for `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub async fn accepted(&self) -> Vec<(String, String)> {
        self.accepted.lock().await.clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, to: &str, body: &str) -> Result<(), TransportError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let ok = self.script.lock().await.pop_front().unwrap_or(self.fallback);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if ok {
            self.accepted
                .lock()
                .await
                .push((to.to_string(), body.to_string()));
            Ok(())
        } else {
            Err(TransportError::Other(format!(
                "mail gateway unavailable (call {})",
                call
            )))
        }
    }
}
