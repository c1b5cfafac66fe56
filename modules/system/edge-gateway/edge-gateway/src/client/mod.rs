//! Per-endpoint outbound clients.
//!
//! A [`Client`] owns a selector over the endpoint's backends and one pooled
//! transport per node. Discovery backends keep their node set fresh from a
//! background task that [`Client::close`] cancels.

mod applier;
pub mod format;
pub mod transport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use edge_gateway_sdk::{Discovery, EndpointConfig};
use http::uri::{PathAndQuery, Scheme};
use http::{Request, Response, Uri, header};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::body::{RequestBody, ResponseBody};
use crate::error::GatewayError;
use crate::middleware::Handler;
use crate::options::{RequestOptions, within_deadline};
use crate::selector::{Node, Selector, WeightedSelector};
use applier::{NodeApplier, Target, spawn_refresh};
use transport::TransportFactory;

/// Builds [`Client`]s for endpoints.
#[derive(Clone)]
pub struct ClientFactory {
    transport: Arc<dyn TransportFactory>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl ClientFactory {
    #[must_use]
    pub fn new(transport: Arc<dyn TransportFactory>) -> Self {
        Self {
            transport,
            discovery: None,
        }
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Build a client over `endpoint`'s backends.
    ///
    /// # Errors
    /// Fails on malformed backend targets, on discovery targets without a
    /// configured [`Discovery`], and when the initial resolve fails.
    pub async fn create(&self, endpoint: &EndpointConfig) -> Result<Client, GatewayError> {
        let targets = endpoint
            .backends
            .iter()
            .map(|b| Target::parse(&b.target).map(|t| (t, b.weight)))
            .collect::<Result<Vec<_>, _>>()?;

        let selector: Arc<dyn Selector> = Arc::new(WeightedSelector::new());
        let applier = Arc::new(NodeApplier::new(
            Arc::clone(&selector),
            Arc::clone(&self.transport),
            targets.len(),
        ));
        let refresh = CancellationToken::new();

        if let Err(err) = self.populate(&applier, targets, &refresh).await {
            refresh.cancel();
            return Err(err);
        }
        applier.publish();

        tracing::debug!(
            path = %endpoint.path,
            nodes = selector.nodes().len(),
            "client created"
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                path: endpoint.path.clone(),
                response_format: endpoint.response_format,
                selector,
                refresh,
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn populate(
        &self,
        applier: &Arc<NodeApplier>,
        targets: Vec<(Target, Option<u32>)>,
        refresh: &CancellationToken,
    ) -> Result<(), GatewayError> {
        for (slot, (target, weight)) in targets.into_iter().enumerate() {
            match target {
                Target::Static { address } => {
                    applier.apply_static(slot, &address, weight.unwrap_or(1))?;
                }
                Target::Discovery { service } => {
                    let discovery =
                        self.discovery
                            .as_ref()
                            .ok_or_else(|| GatewayError::InvalidBackend {
                                target: format!("{}:///{service}", edge_gateway_sdk::DISCOVERY_SCHEME),
                                reason: "no discovery configured".to_owned(),
                            })?;
                    let instances = discovery.resolve(&service).await?;
                    applier.apply_instances(slot, &service, weight, &instances)?;
                    let watcher = discovery.watch(&service).await?;
                    spawn_refresh(
                        Arc::clone(applier),
                        watcher,
                        slot,
                        service,
                        weight,
                        refresh.child_token(),
                    );
                }
            }
        }
        Ok(())
    }
}

/// Outbound transport of one endpoint. Cloning shares the same node set.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    path: String,
    response_format: bool,
    selector: Arc<dyn Selector>,
    refresh: CancellationToken,
    closed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.refresh.cancel();
    }
}

impl Client {
    /// Forward `req` to a selected node.
    ///
    /// The contacted address, its status (0 on transport failure) and the
    /// elapsed latency are appended to `opts`.
    ///
    /// # Errors
    /// [`GatewayError::NoAvailableNode`] when nothing can be selected,
    /// [`GatewayError::Transport`] when the node could not be reached and
    /// [`GatewayError::AttemptTimeout`] when it did not answer before the
    /// attempt deadline.
    pub async fn round_trip(
        &self,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
    ) -> Result<Response<ResponseBody>, GatewayError> {
        let (node, guard) = self.inner.selector.select(&opts.filters)?;
        let req = rewrite_request(req, node.address())?;

        opts.current_node = Some(Arc::clone(&node));
        opts.backends.push(node.address().to_owned());

        let started = Instant::now();
        let result = within_deadline(opts.attempt_deadline, node.transport().oneshot(req)).await;
        opts.upstream_latencies.push(started.elapsed());

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                opts.upstream_status_codes.push(0);
                guard.done(Some(err.to_string()));
                return Err(err);
            }
        };
        opts.upstream_status_codes.push(response.status().as_u16());

        let response = if self.inner.response_format {
            match format::format_response(response).await {
                Ok(response) => response,
                Err(err) => {
                    guard.done(Some(err.to_string()));
                    return Err(err);
                }
            }
        } else {
            response
        };
        opts.set_done(guard);
        Ok(response)
    }

    /// Stop background refresh. Idempotent; in-flight requests are not awaited.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.refresh.cancel();
        tracing::debug!(path = %self.inner.path, "client closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current node table.
    #[must_use]
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.inner.selector.nodes()
    }
}

#[async_trait]
impl Handler for Client {
    async fn handle(
        &self,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
    ) -> Result<Response<ResponseBody>, GatewayError> {
        self.round_trip(req, opts).await
    }
}

/// Point `req` at `address` over plain HTTP, keeping path and query.
/// The inbound `Host` is dropped so the outbound one names the node.
fn rewrite_request(
    req: Request<RequestBody>,
    address: &str,
) -> Result<Request<RequestBody>, GatewayError> {
    let (mut parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::builder()
        .scheme(Scheme::HTTP)
        .authority(address)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| GatewayError::InvalidBackend {
            target: address.to_owned(),
            reason: e.to_string(),
        })?;
    parts.headers.remove(header::HOST);
    Ok(Request::from_parts(parts, body))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use edge_gateway_sdk::{MemoryDiscovery, ServiceInstance};
    use http_body_util::Full;
    use httpmock::prelude::*;
    use transport::HyperTransportFactory;
    use transport::tests::ScriptedTransport;

    fn request(uri: &str) -> Request<RequestBody> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "gateway.example")
            .body(Full::default())
            .unwrap()
    }

    fn opts(endpoint: &EndpointConfig) -> RequestOptions {
        RequestOptions::for_endpoint(Arc::new(endpoint.clone()))
    }

    #[test]
    fn rewrite_keeps_path_and_query() {
        let req = rewrite_request(request("/api/users?id=7"), "10.0.0.1:8080").unwrap();
        assert_eq!(req.uri().to_string(), "http://10.0.0.1:8080/api/users?id=7");
        assert!(req.headers().get(header::HOST).is_none());
    }

    #[tokio::test]
    async fn round_trip_records_backend_status_and_latency() {
        let script = ScriptedTransport::with_statuses(&[201]);
        let factory = ClientFactory::new(Arc::new(script.clone()));
        let endpoint = EndpointConfig::new("/api/*").with_backend("127.0.0.1:9001");
        let client = factory.create(&endpoint).await.unwrap();

        let mut opts = opts(&endpoint);
        let response = client.round_trip(request("/api/x?q=1"), &mut opts).await.unwrap();

        assert_eq!(response.status(), 201);
        assert_eq!(opts.backends, vec!["127.0.0.1:9001".to_owned()]);
        assert_eq!(opts.upstream_status_codes, vec![201]);
        assert_eq!(opts.upstream_latencies.len(), 1);
        assert_eq!(script.seen.lock().as_slice(), ["http://127.0.0.1:9001/api/x?q=1"]);

        let node = Arc::clone(opts.current_node.as_ref().unwrap());
        assert_eq!(node.inflight(), 1);
        opts.finish(None);
        assert_eq!(node.inflight(), 0);
        assert_eq!(node.successes(), 1);
    }

    #[tokio::test]
    async fn transport_failure_records_status_zero() {
        let factory = ClientFactory::new(Arc::new(HyperTransportFactory::default()));
        let endpoint = EndpointConfig::new("/down").with_backend("127.0.0.1:1");
        let client = factory.create(&endpoint).await.unwrap();

        let mut opts = opts(&endpoint);
        let err = client.round_trip(request("/down"), &mut opts).await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)), "{err}");
        assert_eq!(opts.upstream_status_codes, vec![0]);
        assert_eq!(client.nodes()[0].failures(), 1);
    }

    /// Accepts every request and never answers.
    struct Silent;

    impl TransportFactory for Silent {
        fn create(&self, _address: &str) -> Result<transport::NodeTransport, GatewayError> {
            Ok(tower::util::BoxCloneSyncService::new(tower::service_fn(
                |_req: Request<RequestBody>| async {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok::<Response<ResponseBody>, GatewayError>(Response::new(crate::body::empty()))
                },
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_node_fails_at_the_attempt_deadline() {
        let factory = ClientFactory::new(Arc::new(Silent));
        let endpoint = EndpointConfig::new("/slow").with_backend("10.0.0.1:80");
        let client = factory.create(&endpoint).await.unwrap();

        let mut opts = opts(&endpoint);
        opts.attempt_deadline = Some(crate::options::AttemptDeadline::after(
            std::time::Duration::from_millis(50),
        ));
        let err = client.round_trip(request("/slow"), &mut opts).await.unwrap_err();
        assert!(matches!(err, GatewayError::AttemptTimeout(_)), "{err}");
        assert_eq!(opts.upstream_status_codes, vec![0]);
        assert_eq!(opts.upstream_latencies.len(), 1);
        assert_eq!(client.nodes()[0].failures(), 1);
    }

    #[tokio::test]
    async fn empty_backend_set_has_no_available_node() {
        let factory = ClientFactory::new(Arc::new(ScriptedTransport::default()));
        let endpoint = EndpointConfig::new("/none");
        let client = factory.create(&endpoint).await.unwrap();
        let err = client
            .round_trip(request("/none"), &mut opts(&endpoint))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableNode));
    }

    #[tokio::test]
    async fn proxies_to_a_real_upstream() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/echo").query_param("name", "gw");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"echo":"gw"}"#);
        });

        let factory = ClientFactory::new(Arc::new(HyperTransportFactory::default()));
        let endpoint = EndpointConfig::new("/echo")
            .with_backend(format!("http://127.0.0.1:{}", server.port()))
            .with_response_format(true);
        let client = factory.create(&endpoint).await.unwrap();

        let mut opts = opts(&endpoint);
        let response = client.round_trip(request("/echo?name=gw"), &mut opts).await.unwrap();
        let body = http_body_util::BodyExt::collect(response.into_body())
            .await
            .unwrap()
            .to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], 200);
        assert_eq!(value["data"]["echo"], "gw");
        mock.assert_calls(1);
    }

    #[tokio::test]
    async fn discovery_target_without_discovery_fails() {
        let factory = ClientFactory::new(Arc::new(ScriptedTransport::default()));
        let endpoint = EndpointConfig::new("/d").with_backend("discovery:///users");
        let err = factory.create(&endpoint).await.err().unwrap();
        assert!(matches!(err, GatewayError::InvalidBackend { .. }), "{err}");
    }

    #[tokio::test]
    async fn discovery_membership_is_refreshed_until_close() {
        let discovery = MemoryDiscovery::new();
        discovery.register("users", vec![ServiceInstance::new("a", "http://10.0.0.1:80")]);
        let factory = ClientFactory::new(Arc::new(ScriptedTransport::default()))
            .with_discovery(Arc::new(discovery.clone()));
        let endpoint = EndpointConfig::new("/users").with_backend("discovery:///users");
        let client = factory.create(&endpoint).await.unwrap();
        assert_eq!(client.nodes().len(), 1);

        discovery.register(
            "users",
            vec![
                ServiceInstance::new("a", "http://10.0.0.1:80"),
                ServiceInstance::new("b", "http://10.0.0.2:80"),
            ],
        );
        for _ in 0..100 {
            if client.nodes().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(client.nodes().len(), 2);

        client.close();
        client.close();
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn handler_impl_delegates_to_round_trip() {
        let factory = ClientFactory::new(Arc::new(ScriptedTransport::with_statuses(&[204])));
        let endpoint = EndpointConfig::new("/h").with_backend("127.0.0.1:1");
        let client = factory.create(&endpoint).await.unwrap();
        let handler: &dyn Handler = &client;
        let response = handler.handle(request("/h"), &mut opts(&endpoint)).await.unwrap();
        assert_eq!(response.status(), 204);
    }
}
