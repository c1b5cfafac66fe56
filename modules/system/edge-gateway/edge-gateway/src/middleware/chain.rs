use std::sync::Arc;

use edge_gateway_sdk::MiddlewareConfig;

use super::{BoxHandler, BuildContext, Middleware, MiddlewareRegistry};
use crate::client::Client;
use crate::error::GatewayError;

/// A composed, immutable middleware chain around an endpoint's client.
pub struct Pipeline {
    handler: BoxHandler,
    middlewares: Vec<Arc<dyn Middleware>>,
    client: Client,
}

impl Pipeline {
    /// Outermost handler of the chain.
    #[must_use]
    pub fn handler(&self) -> &BoxHandler {
        &self.handler
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Close every middleware, then the client.
    pub fn close(&self) {
        close_all(&self.middlewares);
        self.client.close();
    }
}

fn close_all(middlewares: &[Arc<dyn Middleware>]) {
    for middleware in middlewares.iter().rev() {
        middleware.close();
    }
}

/// Build the client of `ctx.endpoint` and wrap it with `global` followed by
/// the endpoint's own middlewares. The first listed middleware is outermost.
///
/// # Errors
/// Client construction errors propagate unchanged. A required middleware
/// that is not registered, or a failing factory, yields
/// [`GatewayError::MiddlewareConstruction`]; everything built so far is closed.
pub async fn build_pipeline(
    registry: &MiddlewareRegistry,
    ctx: &BuildContext,
    global: &[MiddlewareConfig],
) -> Result<Pipeline, GatewayError> {
    let client = ctx.clients.create(&ctx.endpoint).await?;

    let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();
    for config in global.iter().chain(ctx.endpoint.middlewares.iter()) {
        match instantiate(registry, config, ctx).await {
            Ok(Some(middleware)) => middlewares.push(middleware),
            Ok(None) => {}
            Err(err) => {
                close_all(&middlewares);
                client.close();
                return Err(err);
            }
        }
    }

    let mut handler: BoxHandler = Arc::new(client.clone());
    for middleware in middlewares.iter().rev() {
        handler = middleware.wrap(handler);
    }

    tracing::debug!(
        path = %ctx.endpoint.path,
        middlewares = middlewares.len(),
        "pipeline built"
    );
    Ok(Pipeline {
        handler,
        middlewares,
        client,
    })
}

async fn instantiate(
    registry: &MiddlewareRegistry,
    config: &MiddlewareConfig,
    ctx: &BuildContext,
) -> Result<Option<Arc<dyn Middleware>>, GatewayError> {
    let Some(factory) = registry.get(&config.name) else {
        if config.required {
            return Err(GatewayError::construction(
                &config.name,
                "required middleware is not registered",
            ));
        }
        tracing::warn!(
            middleware = %config.name,
            path = %ctx.endpoint.path,
            "middleware not registered; skipped"
        );
        return Ok(None);
    };
    match factory.create(config, ctx).await {
        Ok(middleware) => Ok(Some(middleware)),
        Err(err @ GatewayError::MiddlewareConstruction { .. }) => Err(err),
        Err(err) => Err(GatewayError::construction(&config.name, err)),
    }
}
