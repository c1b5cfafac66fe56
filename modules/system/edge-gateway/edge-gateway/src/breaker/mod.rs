//! `circuitbreaker` middleware.
//!
//! A [`Trigger`] decides whether a request may reach the rest of the chain.
//! Denied requests are answered by the configured [`BreakAction`] and
//! counted in [`GatewayMetrics`]. Responses that fail the success
//! conditions still reach the caller but count as failures, as do chain
//! errors and attempts cut off by their deadline.

mod action;
mod trigger;
mod window;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_gateway_sdk::{CircuitBreakerConfig, MiddlewareConfig};
use http::{Request, Response};

use crate::body::{RequestBody, ResponseBody};
use crate::condition::{Condition, judge_conditions, parse_conditions};
use crate::error::GatewayError;
use crate::metrics::{GatewayMetrics, MetricsLabels};
use crate::middleware::{BoxHandler, BuildContext, Handler, Middleware, MiddlewareFactory};
use crate::options::{RequestOptions, within_deadline};
use crate::throttle::LogThrottle;

pub use action::{BreakAction, StaticResponse};
pub use trigger::{
    DEFAULT_BUCKET, DEFAULT_REQUEST, DEFAULT_SUCCESS, DEFAULT_WINDOW, NopTrigger, RATIO_SCALE,
    RatioTrigger, SuccessRatioTrigger, Trigger, build_trigger,
};

pub const NAME: &str = "circuitbreaker";

const DENIED_LOG_INTERVAL: Duration = Duration::from_secs(10);

pub(crate) struct CircuitBreakerFactory;

#[async_trait]
impl MiddlewareFactory for CircuitBreakerFactory {
    async fn create(
        &self,
        config: &MiddlewareConfig,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn Middleware>, GatewayError> {
        let options: CircuitBreakerConfig = if config.options.is_null() {
            CircuitBreakerConfig::default()
        } else {
            serde_json::from_value(config.options.clone())
                .map_err(|e| GatewayError::InvalidConfig(format!("circuitbreaker options: {e}")))?
        };
        let trigger = build_trigger(options.trigger.as_ref())?;
        let conditions = parse_conditions(&options.conditions)?;
        let action = BreakAction::build(&options.action, &ctx.clients).await?;
        Ok(Arc::new(CircuitBreaker::new(
            trigger,
            action,
            conditions,
            ctx.metrics.clone(),
            ctx.labels.clone(),
        )))
    }
}

/// Breaker state shared by every wrapped handler of one pipeline.
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

struct BreakerInner {
    trigger: Box<dyn Trigger>,
    action: BreakAction,
    conditions: Vec<Condition>,
    metrics: GatewayMetrics,
    labels: MetricsLabels,
    denied_log: LogThrottle,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(
        trigger: Box<dyn Trigger>,
        action: BreakAction,
        conditions: Vec<Condition>,
        metrics: GatewayMetrics,
        labels: MetricsLabels,
    ) -> Self {
        Self {
            inner: Arc::new(BreakerInner {
                trigger,
                action,
                conditions,
                metrics,
                labels,
                denied_log: LogThrottle::new(DENIED_LOG_INTERVAL),
            }),
        }
    }
}

impl Middleware for CircuitBreaker {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(BreakerHandler {
            breaker: Arc::clone(&self.inner),
            next,
        })
    }

    fn close(&self) {
        self.inner.action.close();
    }
}

struct BreakerHandler {
    breaker: Arc<BreakerInner>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for BreakerHandler {
    async fn handle(
        &self,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
    ) -> Result<Response<ResponseBody>, GatewayError> {
        let breaker = &self.breaker;
        if breaker.trigger.allow().is_err() {
            breaker.trigger.mark_failed();
            breaker.metrics.inc_breaker_denied(&breaker.labels);
            if let Some(suppressed) = breaker.denied_log.permit() {
                tracing::warn!(
                    path = %breaker.labels.path,
                    method = %breaker.labels.method,
                    suppressed,
                    "circuit breaker denied request"
                );
            }
            return breaker.action.respond(req, opts).await;
        }

        let deadline = opts.attempt_deadline;
        let response = match within_deadline(deadline, self.next.handle(req, opts)).await {
            Ok(response) => response,
            Err(err) => {
                breaker.trigger.mark_failed();
                return Err(err);
            }
        };
        if judge_conditions(&breaker.conditions, &response, true) {
            breaker.trigger.mark_success();
        } else {
            breaker.trigger.mark_failed();
        }
        Ok(response)
    }
}
