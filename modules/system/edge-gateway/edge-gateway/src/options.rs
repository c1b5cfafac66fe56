use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use edge_gateway_sdk::EndpointConfig;
use tokio::time::Instant;

use crate::error::GatewayError;

use crate::metrics::MetricsLabels;
use crate::selector::{DoneGuard, Node, NodeFilter};

/// When the running attempt must be over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDeadline {
    pub at: Instant,
    /// Timeout the deadline was derived from; reported on expiry.
    pub timeout: Duration,
}

impl AttemptDeadline {
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }
}

/// Run `fut` until `deadline`, if one is set.
///
/// Pipeline stages that must observe their own outcome, such as the circuit
/// breaker, await the rest of the chain through this so an expired attempt
/// surfaces as an error instead of a dropped future.
///
/// # Errors
/// [`GatewayError::AttemptTimeout`] once the deadline passes; otherwise the
/// outcome of `fut`.
pub async fn within_deadline<T, F>(
    deadline: Option<AttemptDeadline>,
    fut: F,
) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, fut)
            .await
            .unwrap_or(Err(GatewayError::AttemptTimeout(deadline.timeout))),
        None => fut.await,
    }
}

/// Per-request record threaded through every pipeline stage.
///
/// Created when a request enters the engine; each attempt appends the
/// contacted backend, its status (0 when the transport failed) and its
/// latency.
pub struct RequestOptions {
    pub endpoint: Arc<EndpointConfig>,
    pub labels: MetricsLabels,
    /// Applied by the selector before weighting.
    pub filters: Vec<NodeFilter>,
    pub current_node: Option<Arc<Node>>,
    pub backends: Vec<String>,
    pub upstream_status_codes: Vec<u16>,
    pub upstream_latencies: Vec<Duration>,
    /// 1-based number of the running attempt.
    pub attempt: u32,
    /// Set while the final permitted attempt runs and once a response is kept.
    pub last_attempt: bool,
    /// Set by the retry engine for the running attempt.
    pub attempt_deadline: Option<AttemptDeadline>,
    done: Option<DoneGuard>,
}

impl RequestOptions {
    #[must_use]
    pub fn new(endpoint: Arc<EndpointConfig>, labels: MetricsLabels) -> Self {
        Self {
            endpoint,
            labels,
            filters: Vec::new(),
            current_node: None,
            backends: Vec::new(),
            upstream_status_codes: Vec::new(),
            upstream_latencies: Vec::new(),
            attempt: 0,
            last_attempt: false,
            attempt_deadline: None,
            done: None,
        }
    }

    #[must_use]
    pub fn for_endpoint(endpoint: Arc<EndpointConfig>) -> Self {
        let labels = MetricsLabels::from_endpoint(&endpoint);
        Self::new(endpoint, labels)
    }

    /// Keep the guard of the selection whose response is in flight.
    /// A guard already held belongs to a discarded attempt and completes now.
    pub(crate) fn set_done(&mut self, guard: DoneGuard) {
        if let Some(previous) = self.done.replace(guard) {
            previous.done(None);
        }
    }

    /// Complete the pending selection, if any.
    pub fn finish(&mut self, error: Option<String>) {
        if let Some(guard) = self.done.take() {
            guard.done(error);
        }
    }

    /// Fill in status 0 for an attempt that was cut off after a backend
    /// had been contacted.
    pub(crate) fn record_cut_attempt(&mut self, elapsed: Duration) {
        if self.backends.len() > self.upstream_status_codes.len() {
            self.upstream_status_codes.push(0);
        }
        if self.backends.len() > self.upstream_latencies.len() {
            self.upstream_latencies.push(elapsed);
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("path", &self.endpoint.path)
            .field("backends", &self.backends)
            .field("upstream_status_codes", &self.upstream_status_codes)
            .field("upstream_latencies", &self.upstream_latencies)
            .field("attempt", &self.attempt)
            .field("last_attempt", &self.last_attempt)
            .field("attempt_deadline", &self.attempt_deadline)
            .finish_non_exhaustive()
    }
}
