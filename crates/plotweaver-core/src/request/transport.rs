//! Network transports
//!
//! [`Transport`] is the seam between the request client and the wire.
//! [`HttpTransport`] speaks JSON over HTTP with reqwest; tests substitute
//! scripted transports.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::{Error, RequestError, Result};

use super::types::{ApiRequest, ApiResponse, Method};

/// Issues a single attempt of a request.
///
/// Implementations return `Ok` only for 2xx responses and map everything
/// else into [`RequestError`]. Timeouts, retries and caching are layered on
/// top by the request client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, RequestError>;
}

/// JSON-over-HTTP transport for the PlotWeaver API
#[derive(Clone)]
pub struct HttpTransport {
    http_client: HttpClient,
    base_url: String,
    api_token: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.api_token.is_some())
            .finish()
    }
}

/// Builder for creating an HttpTransport
#[derive(Default)]
pub struct HttpTransportBuilder {
    base_url: Option<String>,
    api_token: Option<String>,
    connect_timeout: Option<Duration>,
}

impl HttpTransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the API base URL (e.g. `http://localhost:8000/api`)
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Attach a static bearer token to every request
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<HttpTransport> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigError("API base URL is required".to_string()))?;

        let http_client = HttpClient::builder()
            .connect_timeout(self.connect_timeout.unwrap_or(Duration::from_secs(5)))
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(HttpTransport {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: self.api_token,
        })
    }
}

impl HttpTransport {
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::new()
    }

    /// Build a transport from configuration, reading the token from the environment
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let mut builder = Self::builder().base_url(config.resolved_base_url());
        let token = config
            .resolved_api_token()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        if let Some(token) = token {
            builder = builder.api_token(token);
        }
        builder.build()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn http_client(&self) -> &HttpClient {
        &self.http_client
    }

    pub(crate) fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, RequestError> {
        let url = format!("{}{}", self.base_url, request.endpoint);

        debug!(method = %request.method, url = %url, "Sending request");

        let mut builder = match request.method {
            Method::Get => self.http_client.get(&url),
            Method::Post => self.http_client.post(&url),
            Method::Put => self.http_client.put(&url),
            Method::Delete => self.http_client.delete(&url),
        };
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| RequestError::Network(e.to_string()))?;

        let status = response.status();
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RequestError::Http {
                status: status.as_u16(),
                body: error_detail(&body),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| RequestError::Network(e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| RequestError::Decode(e.to_string()))?
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
            etag,
        })
    }
}

/// Pull the `detail` message out of an error body when the backend sends one
fn error_detail(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body)
        && let Some(detail) = json.get("detail").and_then(|d| d.as_str())
    {
        return detail.to_string();
    }
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_base_url() {
        assert!(HttpTransport::builder().build().is_err());
    }

    #[test]
    fn test_builder_trims_trailing_slash() {
        let transport = HttpTransport::builder()
            .base_url("http://localhost:8000/api/")
            .api_token("secret-token")
            .build()
            .unwrap();
        assert_eq!(transport.base_url(), "http://localhost:8000/api");
        assert_eq!(transport.api_token(), Some("secret-token"));
    }

    #[test]
    fn test_debug_hides_token() {
        let transport = HttpTransport::builder()
            .base_url("http://localhost:8000/api")
            .api_token("secret-token")
            .build()
            .unwrap();
        let debug = format!("{:?}", transport);
        assert!(debug.contains("HttpTransport"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn test_error_detail_extraction() {
        assert_eq!(error_detail(r#"{"detail": "Lock is frozen"}"#), "Lock is frozen");
        assert_eq!(error_detail("plain failure"), "plain failure");
    }

    #[test]
    fn test_transport_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpTransport>();
    }
}
