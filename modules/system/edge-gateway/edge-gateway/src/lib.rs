#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Edge Gateway request dispatch engine
//!
//! Turns a declarative [`GatewayConfig`](edge_gateway_sdk::GatewayConfig)
//! into per-endpoint pipelines and serves inbound requests through them:
//!
//! - route table keyed by path and method, swapped atomically on reload
//! - weighted node selection over static and discovered backends
//! - pooled HTTP/1 upstream transport (hyper)
//! - bounded retries with per-attempt timeouts
//! - adaptive circuit breaking with canned or backup responses
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use edge_gateway::{Gateway, GatewayOptions};
//! use edge_gateway_sdk::{load_config, MemoryConfigSource};
//!
//! let config = load_config("gateway.yaml")?;
//! let gateway = Arc::new(Gateway::new(GatewayOptions::with_transport_config(
//!     config.transport.clone(),
//! ))?);
//! gateway.update(&config).await?;
//!
//! let source = MemoryConfigSource::new(config);
//! gateway.watch(&source)?;
//!
//! let response = gateway.handle(request).await;
//! ```

pub mod body;
pub mod breaker;
pub mod client;
pub mod condition;
pub mod error;
mod features;
mod gateway;
pub mod metrics;
pub mod middleware;
pub mod options;
pub mod random;
mod retry;
pub mod selector;
mod throttle;

pub use body::{RequestBody, ResponseBody};
pub use client::transport::{HyperTransportFactory, NodeTransport, TransportFactory};
pub use client::{Client, ClientFactory};
pub use condition::{Condition, judge_conditions};
pub use error::{BoxError, GatewayError};
pub use features::FeatureToggles;
pub use gateway::{Gateway, GatewayOptions};
pub use metrics::{GatewayMetrics, MetricsLabels};
pub use middleware::{
    BoxHandler, BuildContext, FnFactory, Handler, Middleware, MiddlewareFactory,
    MiddlewareRegistry, Pipeline,
};
pub use options::{AttemptDeadline, RequestOptions, within_deadline};
pub use retry::{DEFAULT_ATTEMPT_TIMEOUT, RetryStrategy};
pub use selector::{Node, Selector, WeightedSelector};
