//! HTTP Client Module
//!
//! Thin async wrapper over `reqwest` used for the CSRF token endpoint and for
//! every request issued through the secure request gate.
//!
//! # Behaviour
//!
//! 1. Relative URLs are resolved against the configured base URL
//! 2. Only `http` and `https` schemes are accepted
//! 3. Response bodies are bounded to prevent memory exhaustion
//! 4. A default timeout applies unless the request overrides it

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Maximum response size (10MB)
pub const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Default request timeout (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Anything able to perform a fetch.
///
/// [`HttpClient`] is the production implementation; tests substitute their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, HttpError>;
}

/// HTTP client for requests to the application backend
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<Url>,
    default_timeout: Duration,
    max_response_size: usize,
}

impl HttpClient {
    /// Create a new HTTP client with default settings and no base URL
    pub fn new() -> Result<Self, HttpError> {
        Self::with_settings(None, DEFAULT_TIMEOUT, MAX_RESPONSE_SIZE)
    }

    /// Create a client resolving relative URLs against `base_url`
    pub fn with_settings(
        base_url: Option<Url>,
        default_timeout: Duration,
        max_response_size: usize,
    ) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(default_timeout)
            .build()
            .map_err(|e| HttpError::ClientInitialization(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            default_timeout,
            max_response_size,
        })
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Resolve and validate a request URL
    pub fn resolve_url(&self, url: &str) -> Result<Url, HttpError> {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self
                    .base_url
                    .as_ref()
                    .ok_or_else(|| HttpError::InvalidUrl(format!("Relative URL without base: {url}")))?;
                base.join(url)
                    .map_err(|e| HttpError::InvalidUrl(e.to_string()))?
            }
            Err(e) => return Err(HttpError::InvalidUrl(e.to_string())),
        };

        // Only allow HTTP and HTTPS
        match parsed.scheme() {
            "http" | "https" => {}
            _ => return Err(HttpError::InvalidUrlScheme(parsed.scheme().to_string())),
        }

        if parsed.host_str().is_none() {
            return Err(HttpError::InvalidUrl("No host in URL".to_string()));
        }

        Ok(parsed)
    }

    fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap, HttpError> {
        let mut header_map = HeaderMap::new();

        for (key, value) in headers {
            let header_name = HeaderName::from_str(key)
                .map_err(|e| HttpError::InvalidHeader(format!("Invalid header name: {}", e)))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::InvalidHeader(format!("Invalid header value: {}", e)))?;

            header_map.insert(header_name, header_value);
        }

        Ok(header_map)
    }

    /// Convert reqwest response to FetchResponse
    async fn convert_response(
        &self,
        response: reqwest::Response,
    ) -> Result<FetchResponse, HttpError> {
        let status = response.status().as_u16();
        let ok = response.status().is_success();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value_str) = value.to_str() {
                headers.insert(key.to_string(), value_str.to_string());
            }
        }

        if let Some(content_length) = response.content_length()
            && content_length > self.max_response_size as u64
        {
            return Err(HttpError::ResponseTooLarge(content_length));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HttpError::ResponseReadFailed(e.to_string()))?;

        if bytes.len() > self.max_response_size {
            return Err(HttpError::ResponseTooLarge(bytes.len() as u64));
        }

        let body = String::from_utf8(bytes.to_vec())
            .map_err(|e| HttpError::ResponseEncodingError(e.to_string()))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
            ok,
        })
    }
}

#[async_trait]
impl HttpTransport for HttpClient {
    async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, HttpError> {
        let parsed_url = self.resolve_url(url)?;

        let method = Method::from_str(&options.method.to_uppercase())
            .map_err(|_| HttpError::InvalidMethod(options.method.clone()))?;

        let headers = Self::build_headers(&options.headers)?;

        let timeout = options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let mut request = self
            .client
            .request(method, parsed_url.as_str())
            .headers(headers)
            .timeout(timeout);

        if let Some(body) = options.body {
            request = request.body(body);
        }

        debug!(url = %parsed_url, method = %options.method, "Fetching URL");
        let response = request
            .send()
            .await
            .map_err(|e| HttpError::RequestFailed(e.to_string()))?;

        self.convert_response(response).await
    }
}

/// Options for fetch request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchOptions {
    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    #[serde(default = "default_method")]
    pub method: String,

    /// Request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body
    #[serde(default)]
    pub body: Option<String>,

    /// Timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: default_method(),
            headers: HashMap::new(),
            body: None,
            timeout_ms: None,
        }
    }
}

impl FetchOptions {
    pub fn method(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    pub fn post() -> Self {
        Self::method("POST")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, serde_json::Error> {
        Ok(self.with_body(serde_json::to_string(value)?))
    }

    /// Whether the method changes server state
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self.method.to_uppercase().as_str(),
            "GET" | "HEAD" | "OPTIONS" | "TRACE"
        )
    }
}

/// Response returned from fetch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers
    pub headers: HashMap<String, String>,

    /// Response body as string
    pub body: String,

    /// Whether the request was successful (2xx status)
    pub ok: bool,
}

impl FetchResponse {
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

/// HTTP client errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HttpError {
    #[error("Failed to initialize HTTP client: {0}")]
    ClientInitialization(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid URL scheme: {0} (only http and https are allowed)")]
    InvalidUrlScheme(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response too large: {0} bytes")]
    ResponseTooLarge(u64),

    #[error("Failed to read response: {0}")]
    ResponseReadFailed(String),

    #[error("Response encoding error: {0}")]
    ResponseEncodingError(String),
}
