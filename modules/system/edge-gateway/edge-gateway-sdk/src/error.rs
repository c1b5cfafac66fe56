//! Error types of the edge gateway SDK.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or watching gateway configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigLoadError {
    /// The config file does not exist.
    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The merged document could not be extracted into the config model.
    #[error("failed to load gateway config: {0}")]
    Extract(#[source] Box<figment::Error>),

    /// A watch was registered for a key the source does not publish.
    #[error("unknown config key: {key}")]
    UnknownKey { key: String },
}

impl From<figment::Error> for ConfigLoadError {
    fn from(err: figment::Error) -> Self {
        Self::Extract(Box::new(err))
    }
}

/// Errors surfaced by a [`Discovery`](crate::Discovery) implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The registry knows nothing about the service.
    #[error("service not found: {service}")]
    ServiceNotFound { service: String },

    /// The watcher stream ended; no further updates will arrive.
    #[error("discovery watcher closed for service: {service}")]
    WatcherClosed { service: String },

    /// Registry specific failure.
    #[error("discovery backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}
