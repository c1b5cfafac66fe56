#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Edge Gateway SDK
//!
//! Transport-agnostic contracts shared by the gateway engine and its
//! embedders:
//!
//! - [`GatewayConfig`] and the rest of the config models (serde)
//! - [`Discovery`] / [`ServiceWatcher`] - service registry contract
//! - [`ConfigSource`] - watchable configuration store
//! - [`load_config`] - figment loader (YAML + `EDGE_GATEWAY__` env overrides)
//!
//! ## Usage
//!
//! ```ignore
//! use edge_gateway_sdk::{load_config, MemoryConfigSource};
//!
//! let config = load_config("gateway.yaml")?;
//! let source = MemoryConfigSource::new(config);
//! gateway.watch(&source)?;
//! ```

pub mod config;
pub mod discovery;
pub mod duration;
pub mod error;
pub mod loader;
pub mod source;

pub use config::{
    ActionConfig, BackendConfig, BackupServiceConfig, CircuitBreakerConfig, ConditionConfig,
    DISCOVERY_SCHEME, EndpointConfig, GatewayConfig, HeaderConditionConfig, HeaderValuesConfig,
    MiddlewareConfig, ResponseDataConfig, RetryConfig, SuccessRatioConfig, TransportConfig,
    TriggerConfig,
};
pub use discovery::{Discovery, MemoryDiscovery, ServiceInstance, ServiceWatcher};
pub use error::{ConfigLoadError, DiscoveryError};
pub use loader::{load_config, load_config_str};
pub use source::{ConfigSource, ENDPOINTS_KEY, MIDDLEWARES_KEY, MemoryConfigSource, WatchCallback};
