//! `logging` middleware: one structured access-log event per request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_gateway_sdk::MiddlewareConfig;
use http::{Request, Response};
use tokio::time::Instant;

use super::{BoxHandler, BuildContext, Handler, Middleware, MiddlewareFactory};
use crate::body::{RequestBody, ResponseBody};
use crate::error::GatewayError;
use crate::options::RequestOptions;

pub const NAME: &str = "logging";

pub(crate) struct LoggingFactory;

#[async_trait]
impl MiddlewareFactory for LoggingFactory {
    async fn create(
        &self,
        _config: &MiddlewareConfig,
        _ctx: &BuildContext,
    ) -> Result<Arc<dyn Middleware>, GatewayError> {
        Ok(Arc::new(AccessLog))
    }
}

/// Stateless access logger.
pub struct AccessLog;

impl Middleware for AccessLog {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(AccessLogHandler { next })
    }
}

struct AccessLogHandler {
    next: BoxHandler,
}

#[async_trait]
impl Handler for AccessLogHandler {
    async fn handle(
        &self,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
    ) -> Result<Response<ResponseBody>, GatewayError> {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let query = req.uri().query().unwrap_or_default().to_owned();
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let result = self.next.handle(req, opts).await;

        let latency_ms = millis(started.elapsed());
        let backend_latency_ms: Vec<u64> =
            opts.upstream_latencies.iter().copied().map(millis).collect();
        let backends = opts.backends.join(",");
        match &result {
            Ok(response) => tracing::info!(
                target: "edge_gateway::access",
                host = %host,
                method = %method,
                path = %path,
                query = %query,
                code = response.status().as_u16(),
                latency_ms,
                backends = %backends,
                backend_codes = ?opts.upstream_status_codes,
                backend_latency_ms = ?backend_latency_ms,
                last_attempt = opts.last_attempt,
                "request completed"
            ),
            Err(err) => tracing::error!(
                target: "edge_gateway::access",
                host = %host,
                method = %method,
                path = %path,
                query = %query,
                code = err.status_code().as_u16(),
                error = %err,
                latency_ms,
                backends = %backends,
                backend_codes = ?opts.upstream_status_codes,
                backend_latency_ms = ?backend_latency_ms,
                last_attempt = opts.last_attempt,
                "request failed"
            ),
        }
        result
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
