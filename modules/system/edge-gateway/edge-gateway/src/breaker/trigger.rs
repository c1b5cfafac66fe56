//! Trip triggers: decide whether the next request may reach the upstream.

use std::time::Duration;

use edge_gateway_sdk::{SuccessRatioConfig, TriggerConfig};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::window::RollingCounter;
use crate::error::GatewayError;
use crate::random::{RandomSource, SeededRandom, SharedRandom, shared};

pub const DEFAULT_SUCCESS: f64 = 0.6;
pub const DEFAULT_REQUEST: u64 = 100;
pub const DEFAULT_BUCKET: usize = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3);

/// Upper bound (exclusive) of the admit-ratio draw.
pub const RATIO_SCALE: u64 = 10_000;

/// Gate consulted before every request and fed with its outcome.
pub trait Trigger: Send + Sync {
    /// # Errors
    /// [`GatewayError::BreakerRejected`] when the request must not proceed.
    fn allow(&self) -> Result<(), GatewayError>;

    fn mark_success(&self);

    fn mark_failed(&self);
}

/// Build the trigger described by `config`. A success-ratio block wins over
/// a static ratio; neither yields [`NopTrigger`].
///
/// # Errors
/// [`GatewayError::InvalidConfig`] for a success ratio outside `(0, 1]`.
pub fn build_trigger(config: Option<&TriggerConfig>) -> Result<Box<dyn Trigger>, GatewayError> {
    let Some(config) = config else {
        return Ok(Box::new(NopTrigger));
    };
    if let Some(sre) = &config.success_ratio {
        return Ok(Box::new(SuccessRatioTrigger::new(sre)?));
    }
    if let Some(ratio) = config.ratio {
        return Ok(Box::new(RatioTrigger::new(ratio)));
    }
    Ok(Box::new(NopTrigger))
}

/// Client-side adaptive throttling over a rolling success window.
pub struct SuccessRatioTrigger {
    k: f64,
    request: u64,
    counter: Mutex<RollingCounter>,
    random: SharedRandom,
}

impl SuccessRatioTrigger {
    /// # Errors
    /// [`GatewayError::InvalidConfig`] for a success ratio outside `(0, 1]`.
    pub fn new(config: &SuccessRatioConfig) -> Result<Self, GatewayError> {
        Self::with_random(config, SeededRandom::default())
    }

    /// # Errors
    /// Same as [`SuccessRatioTrigger::new`].
    pub fn with_random(
        config: &SuccessRatioConfig,
        random: impl RandomSource + 'static,
    ) -> Result<Self, GatewayError> {
        let success = config.success.unwrap_or(DEFAULT_SUCCESS);
        if !(success > 0.0 && success <= 1.0) {
            return Err(GatewayError::InvalidConfig(format!(
                "circuit breaker success ratio must be in (0, 1], got {success}"
            )));
        }
        let counter = RollingCounter::new(
            config.bucket.unwrap_or(DEFAULT_BUCKET),
            config.window.unwrap_or(DEFAULT_WINDOW),
            Instant::now(),
        );
        Ok(Self {
            k: 1.0 / success,
            request: config.request.unwrap_or(DEFAULT_REQUEST),
            counter: Mutex::new(counter),
            random: shared(random),
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn drop_ratio(&self) -> f64 {
        let (accepts, total) = self.counter.lock().summary(Instant::now());
        let weighted = self.k * accepts as f64;
        if total < self.request || (total as f64) < weighted {
            return 0.0;
        }
        ((total as f64 - weighted) / (total as f64 + 1.0)).max(0.0)
    }
}

impl Trigger for SuccessRatioTrigger {
    fn allow(&self) -> Result<(), GatewayError> {
        let ratio = self.drop_ratio();
        if ratio <= 0.0 {
            return Ok(());
        }
        if self.random.lock().unit() < ratio {
            return Err(GatewayError::BreakerRejected);
        }
        Ok(())
    }

    fn mark_success(&self) {
        self.counter.lock().record(true, Instant::now());
    }

    fn mark_failed(&self) {
        self.counter.lock().record(false, Instant::now());
    }
}

/// Admits a fixed share of requests, expressed in ten-thousandths.
pub struct RatioTrigger {
    ratio: u64,
    random: SharedRandom,
}

impl RatioTrigger {
    #[must_use]
    pub fn new(ratio: u32) -> Self {
        Self::with_random(ratio, SeededRandom::default())
    }

    #[must_use]
    pub fn with_random(ratio: u32, random: impl RandomSource + 'static) -> Self {
        Self {
            ratio: u64::from(ratio),
            random: shared(random),
        }
    }
}

impl Trigger for RatioTrigger {
    fn allow(&self) -> Result<(), GatewayError> {
        if self.random.lock().below(RATIO_SCALE) < self.ratio {
            Ok(())
        } else {
            Err(GatewayError::BreakerRejected)
        }
    }

    fn mark_success(&self) {}

    fn mark_failed(&self) {}
}

/// Never trips.
pub struct NopTrigger;

impl Trigger for NopTrigger {
    fn allow(&self) -> Result<(), GatewayError> {
        Ok(())
    }

    fn mark_success(&self) {}

    fn mark_failed(&self) {}
}
