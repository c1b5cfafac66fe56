//! Watchable configuration sources.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::GatewayConfig;
use crate::error::ConfigLoadError;

/// Key published when the endpoint list changes.
pub const ENDPOINTS_KEY: &str = "endpoints";
/// Key published when the global middleware list changes.
pub const MIDDLEWARES_KEY: &str = "middlewares";

/// Callback invoked with the full new configuration.
pub type WatchCallback = Arc<dyn Fn(&GatewayConfig) + Send + Sync>;

/// A configuration store that can notify about changes.
///
/// Callbacks run on the publisher's thread and must not block.
pub trait ConfigSource: Send + Sync {
    /// Snapshot of the current configuration.
    fn current(&self) -> GatewayConfig;

    /// Invokes `callback` whenever the section named by `key` changes.
    ///
    /// # Errors
    /// Returns [`ConfigLoadError::UnknownKey`] for keys the source does not publish.
    fn watch(&self, key: &str, callback: WatchCallback) -> Result<(), ConfigLoadError>;
}

/// Config source held in memory; [`set`](Self::set) publishes a new version.
#[derive(Default)]
pub struct MemoryConfigSource {
    current: RwLock<GatewayConfig>,
    watchers: Mutex<Vec<(String, WatchCallback)>>,
}

impl MemoryConfigSource {
    #[must_use]
    pub fn new(initial: GatewayConfig) -> Self {
        Self {
            current: RwLock::new(initial),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Stores `config` and notifies watchers of every changed section.
    pub fn set(&self, config: GatewayConfig) {
        let previous = std::mem::replace(&mut *self.current.write(), config.clone());
        let endpoints_changed = previous.endpoints != config.endpoints;
        let middlewares_changed = previous.middlewares != config.middlewares;

        let callbacks: Vec<WatchCallback> = self
            .watchers
            .lock()
            .iter()
            .filter(|(key, _)| match key.as_str() {
                ENDPOINTS_KEY => endpoints_changed,
                MIDDLEWARES_KEY => middlewares_changed,
                _ => false,
            })
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        tracing::debug!(
            endpoints_changed,
            middlewares_changed,
            watchers = callbacks.len(),
            "config source updated"
        );
        for callback in callbacks {
            callback(&config);
        }
    }
}

impl ConfigSource for MemoryConfigSource {
    fn current(&self) -> GatewayConfig {
        self.current.read().clone()
    }

    fn watch(&self, key: &str, callback: WatchCallback) -> Result<(), ConfigLoadError> {
        if key != ENDPOINTS_KEY && key != MIDDLEWARES_KEY {
            return Err(ConfigLoadError::UnknownKey {
                key: key.to_owned(),
            });
        }
        self.watchers.lock().push((key.to_owned(), callback));
        Ok(())
    }
}
