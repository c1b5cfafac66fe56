use std::time::Duration;

use edge_gateway_sdk::{ConfigLoadError, DiscoveryError};
use http::StatusCode;
use thiserror::Error;

/// Boxed error carried by transport failures and response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while building or running dispatch pipelines.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// The selector had no eligible node.
    #[error("no available node")]
    NoAvailableNode,

    /// A single attempt did not finish in time.
    #[error("request attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    /// The overall request budget (all attempts) ran out.
    #[error("request deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// The circuit breaker denied the request and no action answered it.
    #[error("request rejected by circuit breaker")]
    BreakerRejected,

    #[error("failed to construct middleware '{name}': {reason}")]
    MiddlewareConstruction { name: String, reason: String },

    #[error("invalid condition '{spec}': {reason}")]
    InvalidCondition { spec: String, reason: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid backend target '{target}': {reason}")]
    InvalidBackend { target: String, reason: String },

    /// Network failure talking to an upstream node.
    #[error("upstream transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("config source error: {0}")]
    ConfigSource(#[from] ConfigLoadError),

    #[error("route conflict: {0}")]
    RouteConflict(String),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl GatewayError {
    /// Status served to the client when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AttemptTimeout(_) | Self::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BreakerRejected | Self::NoAvailableNode => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the retry engine may try again after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::DeadlineExceeded(_)
                | Self::MiddlewareConstruction { .. }
                | Self::InvalidCondition { .. }
                | Self::InvalidConfig(_)
                | Self::InvalidBackend { .. }
                | Self::RouteConflict(_)
                | Self::ConfigSource(_)
                | Self::Metrics(_)
        )
    }

    pub(crate) fn construction(name: &str, reason: impl ToString) -> Self {
        Self::MiddlewareConstruction {
            name: name.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Map a hyper client failure into [`GatewayError::Transport`].
pub(crate) fn map_transport_error(err: hyper_util::client::legacy::Error) -> GatewayError {
    GatewayError::Transport(Box::new(err))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn final_errors_map_to_gateway_statuses() {
        let cases = [
            (
                GatewayError::AttemptTimeout(Duration::from_millis(5)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                GatewayError::DeadlineExceeded(Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (GatewayError::BreakerRejected, StatusCode::SERVICE_UNAVAILABLE),
            (GatewayError::NoAvailableNode, StatusCode::SERVICE_UNAVAILABLE),
            (
                GatewayError::Transport("connection refused".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.status_code(), status, "{err}");
        }
    }

    #[test]
    fn deadline_is_terminal() {
        assert!(!GatewayError::DeadlineExceeded(Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::AttemptTimeout(Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::Transport("reset".into()).is_retryable());
    }
}
