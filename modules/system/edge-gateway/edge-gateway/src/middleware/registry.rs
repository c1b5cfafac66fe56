use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use edge_gateway_sdk::MiddlewareConfig;

use super::{BuildContext, Middleware, MiddlewareFactory};
use crate::breaker::CircuitBreakerFactory;
use crate::error::GatewayError;
use crate::middleware::logging::LoggingFactory;

/// Adapts a synchronous closure into a [`MiddlewareFactory`].
pub struct FnFactory<F>(F);

impl<F> FnFactory<F>
where
    F: Fn(&MiddlewareConfig, &BuildContext) -> Result<Arc<dyn Middleware>, GatewayError>
        + Send
        + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> MiddlewareFactory for FnFactory<F>
where
    F: Fn(&MiddlewareConfig, &BuildContext) -> Result<Arc<dyn Middleware>, GatewayError>
        + Send
        + Sync,
{
    async fn create(
        &self,
        config: &MiddlewareConfig,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn Middleware>, GatewayError> {
        (self.0)(config, ctx)
    }
}

/// Name to factory map owned by a gateway.
#[derive(Default, Clone)]
pub struct MiddlewareRegistry {
    factories: HashMap<String, Arc<dyn MiddlewareFactory>>,
}

impl MiddlewareRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `circuitbreaker` and `logging` middlewares.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(crate::breaker::NAME, Arc::new(CircuitBreakerFactory));
        registry.register(crate::middleware::logging::NAME, Arc::new(LoggingFactory));
        registry
    }

    /// Register `factory` under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn MiddlewareFactory>) {
        let name = name.into();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::warn!(middleware = %name, "middleware factory replaced");
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn MiddlewareFactory>> {
        self.factories.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl fmt::Debug for MiddlewareRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("MiddlewareRegistry")
            .field("factories", &names)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered() {
        let registry = MiddlewareRegistry::with_defaults();
        assert!(registry.contains("circuitbreaker"));
        assert!(registry.contains("logging"));
        assert!(!registry.contains("cors"));
        assert_eq!(
            format!("{registry:?}"),
            r#"MiddlewareRegistry { factories: ["circuitbreaker", "logging"] }"#
        );
    }
}
