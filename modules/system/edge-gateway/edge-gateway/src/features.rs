use std::sync::atomic::{AtomicBool, Ordering};

/// Engine-wide runtime switches, flipped without rebuilding pipelines.
#[derive(Debug)]
pub struct FeatureToggles {
    retry: AtomicBool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            retry: AtomicBool::new(true),
        }
    }
}

impl FeatureToggles {
    #[must_use]
    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Relaxed)
    }

    /// Kill switch for retries: when off every request gets a single attempt.
    pub fn set_retry_enabled(&self, enabled: bool) {
        let previous = self.retry.swap(enabled, Ordering::Relaxed);
        if previous != enabled {
            tracing::info!(enabled, "retry feature toggled");
        }
    }
}
