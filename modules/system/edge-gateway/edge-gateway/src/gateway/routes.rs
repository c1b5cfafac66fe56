use std::collections::HashMap;
use std::sync::Arc;

use edge_gateway_sdk::EndpointConfig;
use http::Method;

use crate::error::GatewayError;
use crate::metrics::MetricsLabels;
use crate::middleware::Pipeline;
use crate::retry::RetryStrategy;

/// One endpoint ready to serve: its pipeline plus everything a request needs.
pub struct CompiledEndpoint {
    pub config: Arc<EndpointConfig>,
    pub labels: MetricsLabels,
    pub retry: RetryStrategy,
    pub pipeline: Pipeline,
}

#[derive(Default)]
struct MethodRoutes {
    by_method: HashMap<Method, Arc<CompiledEndpoint>>,
    any: Option<Arc<CompiledEndpoint>>,
}

impl MethodRoutes {
    fn find(&self, method: &Method) -> Option<&Arc<CompiledEndpoint>> {
        self.by_method.get(method).or(self.any.as_ref())
    }
}

pub enum Resolved<'a> {
    Found(&'a Arc<CompiledEndpoint>),
    NotFound,
    MethodNotAllowed,
}

/// Immutable path and method index over compiled endpoints.
#[derive(Default)]
pub struct RouteTable {
    router: matchit::Router<usize>,
    routes: Vec<MethodRoutes>,
}

impl RouteTable {
    /// Index `endpoints`. On error the caller still owns every endpoint.
    pub fn build(endpoints: &[Arc<CompiledEndpoint>]) -> Result<Self, GatewayError> {
        let mut table = Self::default();
        let mut slots: HashMap<String, usize> = HashMap::new();

        for endpoint in endpoints {
            let pattern = route_pattern(&endpoint.config.path);
            let slot = match slots.get(&pattern) {
                Some(slot) => *slot,
                None => {
                    let slot = table.routes.len();
                    table.router.insert(pattern.clone(), slot).map_err(|e| {
                        GatewayError::RouteConflict(format!("{}: {e}", endpoint.config.path))
                    })?;
                    table.routes.push(MethodRoutes::default());
                    slots.insert(pattern, slot);
                    slot
                }
            };
            table.routes[slot].add(endpoint)?;
        }
        Ok(table)
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Resolved<'_> {
        let Ok(matched) = self.router.at(path) else {
            return Resolved::NotFound;
        };
        match self.routes[*matched.value].find(method) {
            Some(endpoint) => Resolved::Found(endpoint),
            None => Resolved::MethodNotAllowed,
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<CompiledEndpoint>> {
        self.routes
            .iter()
            .flat_map(|r| r.by_method.values().chain(r.any.iter()))
    }

    pub fn len(&self) -> usize {
        self.endpoints().count()
    }
}

impl MethodRoutes {
    fn add(&mut self, endpoint: &Arc<CompiledEndpoint>) -> Result<(), GatewayError> {
        let config = &endpoint.config;
        let conflict = || {
            GatewayError::RouteConflict(format!(
                "duplicate endpoint {} {}",
                if config.method.is_empty() { "*" } else { config.method.as_str() },
                config.path
            ))
        };
        if config.method.is_empty() {
            if self.any.is_some() {
                return Err(conflict());
            }
            self.any = Some(Arc::clone(endpoint));
            return Ok(());
        }
        let method = Method::from_bytes(config.method.to_uppercase().as_bytes()).map_err(|e| {
            GatewayError::InvalidConfig(format!("endpoint {} method: {e}", config.path))
        })?;
        if self.by_method.insert(method, Arc::clone(endpoint)).is_some() {
            return Err(conflict());
        }
        Ok(())
    }
}

/// A trailing `/*` makes the endpoint a prefix route.
fn route_pattern(path: &str) -> String {
    match path.strip_suffix("/*") {
        Some(prefix) => format!("{prefix}/{{*rest}}"),
        None => path.to_owned(),
    }
}
