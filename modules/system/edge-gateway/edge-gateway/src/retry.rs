//! Bounded retries with per-attempt deadlines.
//!
//! Every attempt replays the buffered request through the endpoint's
//! pipeline. Transport errors and attempt timeouts are retried while
//! attempts remain; responses are retried only when they match a retry
//! condition. An overall budget, when configured, caps the whole loop.

use std::sync::Arc;
use std::time::Duration;

use edge_gateway_sdk::EndpointConfig;
use http::{Request, Response};
use http_body_util::BodyExt;
use tokio::time::Instant;

use crate::body::{RequestBody, ResponseBody};
use crate::condition::{Condition, judge_conditions, parse_conditions};
use crate::error::GatewayError;
use crate::middleware::Handler;
use crate::options::{AttemptDeadline, RequestOptions, within_deadline};

/// Per-try timeout when neither the retry policy nor the endpoint sets one.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Discarded responses are drained up to this many bytes so the pooled
/// connection can be reused.
const DRAIN_LIMIT: usize = 64 * 1024;

/// Retry policy compiled from an endpoint.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    attempts: u32,
    per_try_timeout: Duration,
    timeout: Option<Duration>,
    conditions: Arc<[Condition]>,
}

impl RetryStrategy {
    /// # Errors
    /// Returns [`GatewayError::InvalidCondition`] when a retry condition
    /// does not compile.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Result<Self, GatewayError> {
        let retry = endpoint.retry.clone().unwrap_or_default();
        let per_try_timeout = [retry.timeout, endpoint.timeout]
            .into_iter()
            .find(|t| !t.is_zero())
            .unwrap_or(DEFAULT_ATTEMPT_TIMEOUT);
        Ok(Self {
            attempts: retry.count.max(1),
            per_try_timeout,
            timeout: Some(endpoint.timeout).filter(|t| !t.is_zero()),
            conditions: parse_conditions(&retry.conditions)?.into(),
        })
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    #[must_use]
    pub fn per_try_timeout(&self) -> Duration {
        self.per_try_timeout
    }

    /// Overall budget across attempts, if any.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `req` through `handler` under this policy.
    ///
    /// With `retry_enabled == false` exactly one attempt is made and its
    /// response is returned without condition evaluation.
    ///
    /// # Errors
    /// The last attempt's error, or [`GatewayError::DeadlineExceeded`] when
    /// the overall budget runs out.
    pub async fn execute(
        &self,
        handler: &dyn Handler,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
        retry_enabled: bool,
    ) -> Result<Response<ResponseBody>, GatewayError> {
        let attempts = if retry_enabled { self.attempts } else { 1 };
        let deadline_info = self.timeout.map(|t| (Instant::now() + t, t));
        let (parts, body) = req.into_parts();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let last = attempt >= attempts;

            let mut attempt_timeout = self.per_try_timeout;
            if let Some((deadline, budget)) = deadline_info {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(GatewayError::DeadlineExceeded(budget));
                }
                attempt_timeout = attempt_timeout.min(remaining);
            }

            opts.attempt = attempt;
            opts.last_attempt = last;
            let attempt_deadline = AttemptDeadline::after(attempt_timeout);
            opts.attempt_deadline = Some(attempt_deadline);
            let req = Request::from_parts(parts.clone(), body.clone());
            let started = Instant::now();

            // Stages below observe the same deadline and normally report it
            // first; this one only catches handlers that ignore it.
            let result = within_deadline(Some(attempt_deadline), handler.handle(req, opts)).await;
            let result = match result {
                Err(GatewayError::AttemptTimeout(_)) => {
                    opts.record_cut_attempt(started.elapsed());
                    match deadline_info {
                        Some((deadline, budget)) if Instant::now() >= deadline => {
                            Err(GatewayError::DeadlineExceeded(budget))
                        }
                        _ => Err(GatewayError::AttemptTimeout(attempt_timeout)),
                    }
                }
                other => other,
            };

            match result {
                Ok(response) => {
                    if last || !judge_conditions(&self.conditions, &response, false) {
                        opts.last_attempt = true;
                        return Ok(response);
                    }
                    let status = response.status().as_u16();
                    tracing::debug!(
                        attempt,
                        attempts,
                        status,
                        "response matched retry condition; retrying"
                    );
                    opts.finish(Some(format!("retried on status {status}")));
                    if tokio::time::timeout_at(attempt_deadline.at, drain(response))
                        .await
                        .is_err()
                    {
                        tracing::debug!(attempt, "discarded response not drained before deadline");
                    }
                }
                Err(err) => {
                    if last || !err.is_retryable() {
                        return Err(err);
                    }
                    tracing::debug!(attempt, attempts, error = %err, "attempt failed; retrying");
                }
            }
        }
    }
}

async fn drain(response: Response<ResponseBody>) {
    let mut body = std::pin::pin!(response.into_body());
    let mut drained = 0usize;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                drained += frame.data_ref().map_or(0, bytes::Bytes::len);
                if drained >= DRAIN_LIMIT {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "failed to drain discarded response");
                break;
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use bytes::Bytes;
    use http_body::Frame;
    use edge_gateway_sdk::{ConditionConfig, RetryConfig};
    use http_body_util::Full;
    use parking_lot::Mutex;

    use super::*;
    use crate::body::full;
    use crate::error::BoxError;

    enum Step {
        Status(u16),
        Fail,
        Hang,
        /// Headers arrive, the body never does.
        StalledBody(u16),
    }

    struct Stalled;

    impl http_body::Body for Stalled {
        type Data = Bytes;
        type Error = BoxError;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
            Poll::Pending
        }
    }

    /// Plays a script of outcomes and records `(attempt, last_attempt)`.
    struct Script {
        steps: Mutex<VecDeque<Step>>,
        seen: Mutex<Vec<(u32, bool)>>,
    }

    impl Script {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Handler for Script {
        async fn handle(
            &self,
            _req: Request<RequestBody>,
            opts: &mut RequestOptions,
        ) -> Result<Response<ResponseBody>, GatewayError> {
            self.seen.lock().push((opts.attempt, opts.last_attempt));
            let step = self.steps.lock().pop_front().unwrap_or(Step::Status(200));
            match step {
                Step::Status(status) => Ok(Response::builder()
                    .status(status)
                    .body(full("x"))
                    .unwrap()),
                Step::Fail => Err(GatewayError::Transport("connection reset".into())),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Response::new(full("late")))
                }
                Step::StalledBody(status) => Ok(Response::builder()
                    .status(status)
                    .body(Stalled.boxed())
                    .unwrap()),
            }
        }
    }

    fn endpoint(retry: Option<RetryConfig>, timeout: Duration) -> EndpointConfig {
        EndpointConfig {
            retry,
            timeout,
            ..EndpointConfig::new("/r")
        }
    }

    fn retry(count: u32, timeout_ms: u64, conditions: &[&str]) -> Option<RetryConfig> {
        Some(RetryConfig {
            count,
            timeout: Duration::from_millis(timeout_ms),
            conditions: conditions.iter().map(|c| ConditionConfig::status(*c)).collect(),
        })
    }

    fn request() -> Request<RequestBody> {
        Request::builder().uri("/r").body(Full::default()).unwrap()
    }

    fn opts() -> RequestOptions {
        RequestOptions::for_endpoint(Arc::new(EndpointConfig::new("/r")))
    }

    #[test]
    fn timeouts_fall_back_in_order() {
        let s = RetryStrategy::from_endpoint(&endpoint(retry(3, 50, &[]), Duration::from_secs(2)))
            .unwrap();
        assert_eq!(s.attempts(), 3);
        assert_eq!(s.per_try_timeout(), Duration::from_millis(50));
        assert_eq!(s.timeout(), Some(Duration::from_secs(2)));

        let s = RetryStrategy::from_endpoint(&endpoint(retry(0, 0, &[]), Duration::from_secs(2)))
            .unwrap();
        assert_eq!(s.attempts(), 1);
        assert_eq!(s.per_try_timeout(), Duration::from_secs(2));

        let s = RetryStrategy::from_endpoint(&endpoint(None, Duration::ZERO)).unwrap();
        assert_eq!(s.per_try_timeout(), DEFAULT_ATTEMPT_TIMEOUT);
        assert_eq!(s.timeout(), None);
    }

    #[test]
    fn bad_condition_fails_compilation() {
        let err = RetryStrategy::from_endpoint(&endpoint(retry(2, 0, &["5xx"]), Duration::ZERO))
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCondition { .. }));
    }

    #[tokio::test]
    async fn retries_matching_statuses_until_success() {
        let strategy =
            RetryStrategy::from_endpoint(&endpoint(retry(3, 50, &["500-599"]), Duration::ZERO))
                .unwrap();
        let script = Script::new(vec![Step::Status(500), Step::Status(500), Step::Status(200)]);
        let mut opts = opts();

        let response = strategy.execute(&script, request(), &mut opts, true).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            script.seen.lock().as_slice(),
            [(1, false), (2, false), (3, true)]
        );
        assert!(opts.last_attempt);
    }

    #[tokio::test]
    async fn last_matching_response_is_returned() {
        let strategy =
            RetryStrategy::from_endpoint(&endpoint(retry(2, 50, &["503"]), Duration::ZERO))
                .unwrap();
        let script = Script::new(vec![Step::Status(503), Step::Status(503)]);
        let response = strategy
            .execute(&script, request(), &mut opts(), true)
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        assert_eq!(script.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn non_matching_response_ends_the_loop() {
        let strategy =
            RetryStrategy::from_endpoint(&endpoint(retry(3, 50, &["503"]), Duration::ZERO))
                .unwrap();
        let script = Script::new(vec![Step::Status(404)]);
        let mut opts = opts();
        let response = strategy.execute(&script, request(), &mut opts, true).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(script.seen.lock().as_slice(), [(1, false)]);
        assert!(opts.last_attempt);
    }

    #[tokio::test]
    async fn transport_errors_are_retried_without_conditions() {
        let strategy =
            RetryStrategy::from_endpoint(&endpoint(retry(2, 50, &[]), Duration::ZERO)).unwrap();
        let script = Script::new(vec![Step::Fail, Step::Status(200)]);
        let response = strategy
            .execute(&script, request(), &mut opts(), true)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let script = Script::new(vec![Step::Fail, Step::Fail]);
        let err = strategy
            .execute(&script, request(), &mut opts(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_times_out_and_is_retried() {
        let strategy =
            RetryStrategy::from_endpoint(&endpoint(retry(2, 50, &[]), Duration::ZERO)).unwrap();
        let script = Script::new(vec![Step::Hang, Step::Status(200)]);
        let response = strategy
            .execute(&script, request(), &mut opts(), true)
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let script = Script::new(vec![Step::Hang]);
        let err = strategy
            .execute(&script, request(), &mut opts(), false)
            .await
            .unwrap_err();
        assert!(
            matches!(err, GatewayError::AttemptTimeout(t) if t == Duration::from_millis(50)),
            "{err}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overall_budget_caps_the_loop() {
        let strategy = RetryStrategy::from_endpoint(&endpoint(
            retry(5, 100, &[]),
            Duration::from_millis(150),
        ))
        .unwrap();
        let script = Script::new(vec![Step::Hang, Step::Hang, Step::Hang]);
        let started = Instant::now();
        let err = strategy
            .execute(&script, request(), &mut opts(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DeadlineExceeded(_)), "{err}");
        assert_eq!(script.seen.lock().len(), 2);
        assert!(started.elapsed() <= Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_body_of_a_discarded_response_is_abandoned() {
        let strategy = RetryStrategy::from_endpoint(&endpoint(
            retry(3, 100, &["500-599"]),
            Duration::from_secs(1),
        ))
        .unwrap();
        let script = Script::new(vec![Step::StalledBody(500), Step::StalledBody(502)]);
        let started = Instant::now();
        let response = tokio::time::timeout(
            Duration::from_secs(60),
            strategy.execute(&script, request(), &mut opts(), true),
        )
        .await
        .expect("retry loop must not wait on a stalled body")
        .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(script.seen.lock().len(), 3);
        assert!(started.elapsed() <= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn kill_switch_makes_a_single_attempt() {
        let strategy =
            RetryStrategy::from_endpoint(&endpoint(retry(3, 50, &["500"]), Duration::ZERO))
                .unwrap();
        let script = Script::new(vec![Step::Status(500), Step::Status(200)]);
        let response = strategy
            .execute(&script, request(), &mut opts(), false)
            .await
            .unwrap();
        assert_eq!(response.status(), 500);
        assert_eq!(script.seen.lock().as_slice(), [(1, true)]);
    }
}
