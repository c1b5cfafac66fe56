//! Configuration models for the edge gateway.
//!
//! Every struct uses `#[serde(default)]`, so a partial document is always
//! valid input. Durations are humantime strings (`"500ms"`, `"3s"`).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix for `discovery:///service-name` backend targets.
pub const DISCOVERY_SCHEME: &str = "discovery";

/// Root gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Routed endpoints, compiled into pipelines on every reload.
    pub endpoints: Vec<EndpointConfig>,
    /// Middlewares wrapped around every endpoint, outside the endpoint's own list.
    pub middlewares: Vec<MiddlewareConfig>,
    /// Outbound connection pool settings, applied when the gateway is created.
    pub transport: TransportConfig,
}

/// One routed endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Route path. A trailing `/*` makes it a prefix route.
    pub path: String,
    /// HTTP method; empty matches any method.
    pub method: String,
    pub protocol: String,
    pub description: String,
    /// Virtual host the endpoint is published under. Informational; routing
    /// matches on path and method only.
    pub host: String,
    /// Free-form labels. `service` and `basePath` feed metric labels.
    pub metadata: BTreeMap<String, String>,
    /// Wrap upstream JSON bodies into the standard response envelope.
    pub response_format: bool,
    /// Overall budget for the request including retries; zero means none.
    #[serde(with = "crate::duration")]
    pub timeout: Duration,
    pub middlewares: Vec<MiddlewareConfig>,
    pub backends: Vec<BackendConfig>,
    pub retry: Option<RetryConfig>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            method: String::new(),
            protocol: "HTTP".to_owned(),
            description: String::new(),
            host: String::new(),
            metadata: BTreeMap::new(),
            response_format: false,
            timeout: Duration::ZERO,
            middlewares: Vec::new(),
            backends: Vec::new(),
            retry: None,
        }
    }
}

impl EndpointConfig {
    /// Shorthand used by tests and embedders.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn with_backend(mut self, target: impl Into<String>) -> Self {
        self.backends.push(BackendConfig {
            target: target.into(),
            weight: None,
        });
        self
    }

    #[must_use]
    pub fn with_middleware(mut self, middleware: MiddlewareConfig) -> Self {
        self.middlewares.push(middleware);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_response_format(mut self, enabled: bool) -> Self {
        self.response_format = enabled;
        self
    }
}

/// Upstream target of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// `host:port`, `http://host:port` or `discovery:///service-name`.
    pub target: String,
    /// Load-balancing weight; 1 when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

/// A named middleware with an opaque options bag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub name: String,
    /// Decoded by the middleware factory with `serde_json::from_value`.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
    /// A required middleware with no registered factory fails the endpoint.
    pub required: bool,
}

impl MiddlewareConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Retry policy of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero behaves as one.
    pub count: u32,
    /// Per-attempt timeout; zero falls back to the endpoint timeout.
    #[serde(with = "crate::duration")]
    pub timeout: Duration,
    /// Responses matching any of these are retried.
    pub conditions: Vec<ConditionConfig>,
}

/// A declarative response predicate: either a header match or a status spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderConditionConfig>,
    /// `"503"` or an inclusive range `"500-599"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
}

impl ConditionConfig {
    #[must_use]
    pub fn status(spec: impl Into<String>) -> Self {
        Self {
            header: None,
            status_code: Some(spec.into()),
        }
    }

    #[must_use]
    pub fn header(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: Some(HeaderConditionConfig {
                name: name.into(),
                value: value.into(),
            }),
            status_code: None,
        }
    }
}

/// Header match. A value starting with `[` is a JSON array of accepted values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConditionConfig {
    pub name: String,
    pub value: String,
}

/// Options bag of the `circuitbreaker` middleware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,
    pub action: ActionConfig,
    /// Responses matching any of these count as successes; empty means all do.
    pub conditions: Vec<ConditionConfig>,
}

/// Trip trigger. `success_ratio` wins when both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_ratio: Option<SuccessRatioConfig>,
    /// Admitted share in units of 1/10000.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratio: Option<u32>,
}

/// Adaptive throttling window. Unset fields use the trigger defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuccessRatioConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<usize>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "crate::duration::option"
    )]
    pub window: Option<Duration>,
}

/// What the breaker serves while open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<ResponseDataConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_service: Option<BackupServiceConfig>,
}

/// Canned response served while the breaker is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseDataConfig {
    pub status_code: u16,
    pub header: Vec<HeaderValuesConfig>,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderValuesConfig {
    pub key: String,
    pub value: Vec<String>,
}

/// Fallback endpoint served while the breaker is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupServiceConfig {
    pub endpoint: EndpointConfig,
}

/// Outbound connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Idle pooled connections are closed after this long; `None` keeps them.
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "crate::duration::option"
    )]
    pub pool_idle_timeout: Option<Duration>,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
        }
    }
}
