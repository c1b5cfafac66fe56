//! Figment based config loading: a YAML document merged with
//! `EDGE_GATEWAY__`-prefixed environment overrides.
//!
//! Nested keys are separated by a double underscore, e.g.
//! `EDGE_GATEWAY__TRANSPORT__POOL_MAX_IDLE_PER_HOST=8`.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};

use crate::config::GatewayConfig;
use crate::error::ConfigLoadError;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "EDGE_GATEWAY__";

/// Loads the gateway config from a YAML file plus environment overrides.
///
/// # Errors
/// Returns [`ConfigLoadError::NotFound`] when the file is missing and
/// [`ConfigLoadError::Extract`] when the merged document does not fit the model.
pub fn load_config(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigLoadError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(ConfigLoadError::NotFound {
            path: path.to_path_buf(),
        });
    }
    extract(Figment::new().merge(Yaml::file(path)))
}

/// Same as [`load_config`] for an in-memory YAML document.
///
/// # Errors
/// Returns [`ConfigLoadError::Extract`] when the merged document does not fit the model.
pub fn load_config_str(yaml: &str) -> Result<GatewayConfig, ConfigLoadError> {
    extract(Figment::new().merge(Yaml::string(yaml)))
}

fn extract(figment: Figment) -> Result<GatewayConfig, ConfigLoadError> {
    let config: GatewayConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    tracing::debug!(
        endpoints = config.endpoints.len(),
        middlewares = config.middlewares.len(),
        "gateway config loaded"
    );
    Ok(config)
}
