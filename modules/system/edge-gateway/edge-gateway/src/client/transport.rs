//! Per-node outbound transports.

use edge_gateway_sdk::TransportConfig;
use http::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;

use crate::body::{RequestBody, ResponseBody, boxed_response};
use crate::error::{GatewayError, map_transport_error};

/// Type-erased transport bound to one node.
pub type NodeTransport =
    BoxCloneSyncService<Request<RequestBody>, Response<ResponseBody>, GatewayError>;

/// Builds a transport for a node address (`host:port`).
pub trait TransportFactory: Send + Sync {
    /// # Errors
    /// Returns an error when the transport cannot be constructed for `address`.
    fn create(&self, address: &str) -> Result<NodeTransport, GatewayError>;
}

/// Plain HTTP/1 transport over a pooled hyper client.
#[derive(Debug, Clone, Default)]
pub struct HyperTransportFactory {
    config: TransportConfig,
}

impl HyperTransportFactory {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for HyperTransportFactory {
    fn create(&self, address: &str) -> Result<NodeTransport, GatewayError> {
        let mut builder = Client::builder(TokioExecutor::new());
        // pool_idle_timeout needs a timer to take effect
        builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host);
        if let Some(idle_timeout) = self.config.pool_idle_timeout {
            builder.pool_idle_timeout(idle_timeout);
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = builder.build::<_, RequestBody>(connector);

        let service = client
            .map_response(boxed_response)
            .map_err(map_transport_error);

        tracing::debug!(address, "node transport created");
        Ok(BoxCloneSyncService::new(service))
    }
}
