//! Route table, hot reload and request entry point.
//!
//! [`Gateway::update`] compiles every endpoint of a configuration into a
//! fresh route table and publishes it with a single atomic swap. Requests in
//! flight keep the table they started with; pipelines of a replaced table
//! are closed right after the swap.

mod routes;

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use edge_gateway_sdk::{
    ConfigSource, Discovery, ENDPOINTS_KEY, EndpointConfig, GatewayConfig, MIDDLEWARES_KEY,
    MiddlewareConfig, TransportConfig,
};
use http::{Request, Response, StatusCode};
use prometheus::Registry;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::body::{RequestBody, ResponseBody, empty};
use crate::client::ClientFactory;
use crate::client::transport::{HyperTransportFactory, TransportFactory};
use crate::error::GatewayError;
use crate::features::FeatureToggles;
use crate::metrics::{GatewayMetrics, MetricsLabels};
use crate::middleware::{BuildContext, MiddlewareRegistry, build_pipeline};
use crate::options::RequestOptions;
use crate::retry::RetryStrategy;
use routes::{CompiledEndpoint, Resolved, RouteTable};

/// Collaborators of a [`Gateway`].
pub struct GatewayOptions {
    pub discovery: Option<Arc<dyn Discovery>>,
    pub transport: Arc<dyn TransportFactory>,
    pub registry: MiddlewareRegistry,
    pub metrics_registry: Registry,
    pub features: Arc<FeatureToggles>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            discovery: None,
            transport: Arc::new(HyperTransportFactory::default()),
            registry: MiddlewareRegistry::with_defaults(),
            metrics_registry: Registry::new(),
            features: Arc::new(FeatureToggles::default()),
        }
    }
}

impl GatewayOptions {
    /// Defaults with the outbound pool configured from `transport`.
    #[must_use]
    pub fn with_transport_config(transport: TransportConfig) -> Self {
        Self {
            transport: Arc::new(HyperTransportFactory::new(transport)),
            ..Self::default()
        }
    }
}

/// The request dispatch engine.
pub struct Gateway {
    table: ArcSwap<RouteTable>,
    clients: ClientFactory,
    registry: MiddlewareRegistry,
    metrics: GatewayMetrics,
    metrics_registry: Registry,
    features: Arc<FeatureToggles>,
    update_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Wire collaborators and register the gateway's metrics. The route
    /// table starts empty.
    ///
    /// # Errors
    /// [`GatewayError::Metrics`] when the metrics are already registered in
    /// `options.metrics_registry`.
    pub fn new(options: GatewayOptions) -> Result<Self, GatewayError> {
        let metrics = GatewayMetrics::register(&options.metrics_registry)?;
        let mut clients = ClientFactory::new(options.transport);
        if let Some(discovery) = options.discovery {
            clients = clients.with_discovery(discovery);
        }
        Ok(Self {
            table: ArcSwap::from_pointee(RouteTable::default()),
            clients,
            registry: options.registry,
            metrics,
            metrics_registry: options.metrics_registry,
            features: options.features,
            update_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn features(&self) -> &Arc<FeatureToggles> {
        &self.features
    }

    #[must_use]
    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_registry(&self) -> &Registry {
        &self.metrics_registry
    }

    /// Number of endpoints in the live table.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.table.load().len()
    }

    /// Compile `config` and make it live.
    ///
    /// Either every endpoint compiles and the new table replaces the old one
    /// at once, or nothing changes and the first error is returned.
    ///
    /// # Errors
    /// Any pipeline construction or routing error.
    pub async fn update(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        let _guard = self.update_lock.lock().await;

        let mut compiled: Vec<Arc<CompiledEndpoint>> = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            match self.compile(endpoint, &config.middlewares).await {
                Ok(endpoint) => compiled.push(Arc::new(endpoint)),
                Err(err) => {
                    close_endpoints(&compiled);
                    tracing::error!(
                        path = %endpoint.path,
                        error = %err,
                        "endpoint build failed; keeping current routes"
                    );
                    return Err(err);
                }
            }
        }
        let table = match RouteTable::build(&compiled) {
            Ok(table) => table,
            Err(err) => {
                close_endpoints(&compiled);
                tracing::error!(error = %err, "route table build failed; keeping current routes");
                return Err(err);
            }
        };

        let endpoints = table.len();
        let previous = self.table.swap(Arc::new(table));
        for endpoint in previous.endpoints() {
            endpoint.pipeline.close();
        }
        tracing::info!(endpoints, "route table updated");
        Ok(())
    }

    async fn compile(
        &self,
        endpoint: &EndpointConfig,
        global: &[MiddlewareConfig],
    ) -> Result<CompiledEndpoint, GatewayError> {
        let config = Arc::new(endpoint.clone());
        let labels = MetricsLabels::from_endpoint(&config);
        let retry = RetryStrategy::from_endpoint(&config)?;
        let ctx = BuildContext {
            endpoint: Arc::clone(&config),
            labels: labels.clone(),
            clients: self.clients.clone(),
            metrics: self.metrics.clone(),
        };
        let pipeline = build_pipeline(&self.registry, &ctx, global).await?;
        Ok(CompiledEndpoint {
            config,
            labels,
            retry,
            pipeline,
        })
    }

    /// Serve one inbound request.
    pub async fn handle(&self, req: Request<RequestBody>) -> Response<ResponseBody> {
        self.dispatch(req).await.0
    }

    /// Like [`Gateway::handle`], also returning the request record when a
    /// route matched.
    pub async fn dispatch(
        &self,
        req: Request<RequestBody>,
    ) -> (Response<ResponseBody>, Option<RequestOptions>) {
        let table = self.table.load_full();
        let endpoint = match table.resolve(req.method(), req.uri().path()) {
            Resolved::Found(endpoint) => Arc::clone(endpoint),
            Resolved::NotFound => return (status_response(StatusCode::NOT_FOUND), None),
            Resolved::MethodNotAllowed => {
                return (status_response(StatusCode::METHOD_NOT_ALLOWED), None);
            }
        };
        drop(table);

        let mut opts = RequestOptions::new(Arc::clone(&endpoint.config), endpoint.labels.clone());
        let result = endpoint
            .retry
            .execute(
                &**endpoint.pipeline.handler(),
                req,
                &mut opts,
                self.features.retry_enabled(),
            )
            .await;

        let response = match result {
            Ok(response) => {
                opts.finish(None);
                response
            }
            Err(err) => {
                opts.finish(Some(err.to_string()));
                tracing::debug!(path = %endpoint.config.path, error = %err, "request failed");
                status_response(err.status_code())
            }
        };
        (response, Some(opts))
    }

    /// Rebuild the route table whenever `source` publishes new endpoints or
    /// global middlewares. Updates are applied in order on a background task;
    /// a failed update is logged and the previous table stays live.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// [`GatewayError::ConfigSource`] when the source rejects a watch.
    pub fn watch(self: &Arc<Self>, source: &dyn ConfigSource) -> Result<(), GatewayError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<GatewayConfig>();
        for key in [ENDPOINTS_KEY, MIDDLEWARES_KEY] {
            let tx = tx.clone();
            source.watch(
                key,
                Arc::new(move |config: &GatewayConfig| {
                    // receiver gone means the gateway is closed
                    let _ = tx.send(config.clone());
                }),
            )?;
        }

        let gateway: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let mut config = tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(config) => config,
                        None => break,
                    },
                };
                // one change may notify several keys; apply only the newest
                while let Ok(newer) = rx.try_recv() {
                    config = newer;
                }
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                if let Err(err) = gateway.update(&config).await {
                    tracing::error!(error = %err, "config reload failed");
                }
            }
            tracing::debug!("config watch stopped");
        });
        Ok(())
    }

    /// Stop config watches and close every live pipeline.
    pub async fn close(&self) {
        let _guard = self.update_lock.lock().await;
        self.shutdown.cancel();
        let previous = self.table.swap(Arc::new(RouteTable::default()));
        for endpoint in previous.endpoints() {
            endpoint.pipeline.close();
        }
        tracing::info!("gateway closed");
    }
}

fn close_endpoints(endpoints: &[Arc<CompiledEndpoint>]) {
    for endpoint in endpoints {
        endpoint.pipeline.close();
    }
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}
