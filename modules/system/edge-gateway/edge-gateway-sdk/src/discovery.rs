//! Service discovery contract.
//!
//! Registry protocols live outside this workspace and plug in by
//! implementing [`Discovery`]. [`MemoryDiscovery`] is an in-process
//! registry used for tests and for embedding with a fixed topology.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::DiscoveryError;

/// Metadata key carrying an instance's load-balancing weight.
pub const WEIGHT_METADATA_KEY: &str = "weight";

/// One registered instance of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    /// Endpoint URLs, e.g. `http://10.0.0.7:8000` or `grpc://10.0.0.7:9000`.
    pub endpoints: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    #[must_use]
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoints: vec![endpoint.into()],
            ..Self::default()
        }
    }

    /// Weight advertised in metadata, if any.
    #[must_use]
    pub fn weight(&self) -> Option<u32> {
        self.metadata
            .get(WEIGHT_METADATA_KEY)
            .and_then(|w| w.parse().ok())
    }
}

/// Resolves service names into instance lists.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Current membership of `service`.
    async fn resolve(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError>;

    /// Starts watching `service`; the watcher yields full membership lists.
    async fn watch(&self, service: &str) -> Result<Box<dyn ServiceWatcher>, DiscoveryError>;
}

/// Stream of membership updates. Dropping the watcher stops it.
#[async_trait]
pub trait ServiceWatcher: Send {
    /// Waits for the next membership change.
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, DiscoveryError>;
}

/// In-memory registry backed by `tokio::sync::watch` channels.
#[derive(Default, Clone)]
pub struct MemoryDiscovery {
    services: Arc<Mutex<HashMap<String, watch::Sender<Vec<ServiceInstance>>>>>,
}

impl MemoryDiscovery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the membership of `service` and notifies its watchers.
    pub fn register(&self, service: &str, instances: Vec<ServiceInstance>) {
        let mut services = self.services.lock();
        match services.get(service) {
            Some(tx) => {
                tx.send_replace(instances);
            }
            None => {
                let (tx, _rx) = watch::channel(instances);
                services.insert(service.to_owned(), tx);
            }
        }
    }

    fn subscribe(&self, service: &str) -> Result<watch::Receiver<Vec<ServiceInstance>>, DiscoveryError> {
        self.services
            .lock()
            .get(service)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| DiscoveryError::ServiceNotFound {
                service: service.to_owned(),
            })
    }
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn resolve(&self, service: &str) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        let rx = self.subscribe(service)?;
        let instances = rx.borrow().clone();
        Ok(instances)
    }

    async fn watch(&self, service: &str) -> Result<Box<dyn ServiceWatcher>, DiscoveryError> {
        let mut rx = self.subscribe(service)?;
        rx.mark_unchanged();
        Ok(Box::new(MemoryWatcher {
            service: service.to_owned(),
            rx,
        }))
    }
}

struct MemoryWatcher {
    service: String,
    rx: watch::Receiver<Vec<ServiceInstance>>,
}

#[async_trait]
impl ServiceWatcher for MemoryWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, DiscoveryError> {
        self.rx
            .changed()
            .await
            .map_err(|_| DiscoveryError::WatcherClosed {
                service: self.service.clone(),
            })?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
