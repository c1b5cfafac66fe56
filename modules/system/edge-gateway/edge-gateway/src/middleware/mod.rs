//! Pluggable request interceptors.
//!
//! A [`Middleware`] wraps the next [`Handler`] in the chain. Factories are
//! looked up by name in a [`MiddlewareRegistry`] and composed by
//! [`build_pipeline`] so that the first configured middleware is the
//! outermost one and the endpoint's [`Client`](crate::Client) is innermost.

mod chain;
pub mod logging;
mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use edge_gateway_sdk::{EndpointConfig, MiddlewareConfig};
use http::{Request, Response};

use crate::body::{RequestBody, ResponseBody};
use crate::client::ClientFactory;
use crate::error::GatewayError;
use crate::metrics::{GatewayMetrics, MetricsLabels};
use crate::options::RequestOptions;

pub use chain::{Pipeline, build_pipeline};
pub use registry::{FnFactory, MiddlewareRegistry};

/// One stage of a dispatch pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
    ) -> Result<Response<ResponseBody>, GatewayError>;
}

pub type BoxHandler = Arc<dyn Handler>;

/// An interceptor built once per pipeline.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BoxHandler) -> BoxHandler;

    /// Release resources owned by the middleware. Stateless middlewares
    /// keep the default.
    fn close(&self) {}
}

/// Everything a factory may need besides its own options bag.
#[derive(Clone)]
pub struct BuildContext {
    pub endpoint: Arc<EndpointConfig>,
    pub labels: MetricsLabels,
    pub clients: ClientFactory,
    pub metrics: GatewayMetrics,
}

/// Constructs a middleware from its config.
#[async_trait]
pub trait MiddlewareFactory: Send + Sync {
    async fn create(
        &self,
        config: &MiddlewareConfig,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn Middleware>, GatewayError>;
}
