//! Prometheus instruments of the dispatch engine.

use edge_gateway_sdk::EndpointConfig;
use prometheus::{IntCounterVec, Opts, Registry};

use crate::error::GatewayError;

const NAMESPACE: &str = "edge_gateway";
const LABELS: [&str; 5] = ["protocol", "method", "path", "service", "base_path"];

/// Metric labels derived from an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsLabels {
    pub protocol: String,
    pub method: String,
    pub path: String,
    pub service: String,
    pub base_path: String,
}

impl MetricsLabels {
    #[must_use]
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Self {
        let meta = |key: &str| endpoint.metadata.get(key).cloned().unwrap_or_default();
        Self {
            protocol: endpoint.protocol.clone(),
            method: if endpoint.method.is_empty() {
                "*".to_owned()
            } else {
                endpoint.method.to_uppercase()
            },
            path: endpoint.path.clone(),
            service: meta("service"),
            base_path: meta("basePath"),
        }
    }

    fn values(&self) -> [&str; 5] {
        [
            &self.protocol,
            &self.method,
            &self.path,
            &self.service,
            &self.base_path,
        ]
    }
}

/// Counters shared by every pipeline of one gateway.
#[derive(Clone)]
pub struct GatewayMetrics {
    breaker_denied: IntCounterVec,
}

impl GatewayMetrics {
    /// Create the instruments and register them into `registry`.
    ///
    /// # Errors
    /// Returns [`GatewayError::Metrics`] when a metric with the same name is
    /// already registered.
    pub fn register(registry: &Registry) -> Result<Self, GatewayError> {
        let breaker_denied = IntCounterVec::new(
            Opts::new(
                "requests_circuit_breaker_denied_total",
                "Total number of requests denied by the circuit breaker",
            )
            .namespace(NAMESPACE),
            &LABELS,
        )?;
        registry.register(Box::new(breaker_denied.clone()))?;
        Ok(Self { breaker_denied })
    }

    pub fn inc_breaker_denied(&self, labels: &MetricsLabels) {
        self.breaker_denied
            .with_label_values(&labels.values())
            .inc();
    }

    #[must_use]
    pub fn breaker_denied(&self, labels: &MetricsLabels) -> u64 {
        self.breaker_denied.with_label_values(&labels.values()).get()
    }
}
