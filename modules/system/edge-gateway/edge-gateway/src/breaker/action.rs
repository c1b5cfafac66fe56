use bytes::Bytes;
use edge_gateway_sdk::{ActionConfig, ResponseDataConfig};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};

use crate::body::{RequestBody, ResponseBody, full};
use crate::client::{Client, ClientFactory};
use crate::error::GatewayError;
use crate::options::RequestOptions;

/// Canned response served while the breaker is open.
#[derive(Debug, Clone)]
pub struct StaticResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl StaticResponse {
    /// # Errors
    /// [`GatewayError::InvalidConfig`] for an out-of-range status or an
    /// invalid header name or value.
    pub fn from_config(config: &ResponseDataConfig) -> Result<Self, GatewayError> {
        let status = StatusCode::from_u16(config.status_code).map_err(|e| {
            GatewayError::InvalidConfig(format!(
                "breaker response status {}: {e}",
                config.status_code
            ))
        })?;
        let mut headers = HeaderMap::new();
        for header in &config.header {
            let name = HeaderName::from_bytes(header.key.as_bytes()).map_err(|e| {
                GatewayError::InvalidConfig(format!("breaker response header '{}': {e}", header.key))
            })?;
            for value in &header.value {
                let value = HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::InvalidConfig(format!(
                        "breaker response header '{}' value: {e}",
                        header.key
                    ))
                })?;
                headers.append(name.clone(), value);
            }
        }
        Ok(Self {
            status,
            headers,
            body: Bytes::from(config.body.clone()),
        })
    }

    fn unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn to_response(&self) -> Response<ResponseBody> {
        let mut response = Response::new(full(self.body.clone()));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

/// What a denied request gets instead of the primary chain.
pub enum BreakAction {
    Static(StaticResponse),
    /// Forward to a fallback endpoint through its own client.
    Backup(Client),
}

impl BreakAction {
    /// Build the action. An empty config serves `503` with no body; a
    /// backup service wins over a canned response when both are set.
    ///
    /// # Errors
    /// Invalid canned responses and backup client construction failures.
    pub async fn build(
        config: &ActionConfig,
        clients: &ClientFactory,
    ) -> Result<Self, GatewayError> {
        if let Some(backup) = &config.backup_service {
            let client = clients.create(&backup.endpoint).await?;
            return Ok(Self::Backup(client));
        }
        if let Some(data) = &config.response_data {
            return Ok(Self::Static(StaticResponse::from_config(data)?));
        }
        Ok(Self::Static(StaticResponse::unavailable()))
    }

    pub async fn respond(
        &self,
        req: Request<RequestBody>,
        opts: &mut RequestOptions,
    ) -> Result<Response<ResponseBody>, GatewayError> {
        match self {
            Self::Static(response) => Ok(response.to_response()),
            Self::Backup(client) => client.round_trip(req, opts).await,
        }
    }

    pub fn close(&self) {
        if let Self::Backup(client) = self {
            client.close();
        }
    }
}
