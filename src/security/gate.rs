// Secure Request Gate
// Attaches the current CSRF token to outgoing requests

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::http_client::{FetchOptions, FetchResponse, HttpError, HttpTransport};
use crate::security::token::{SecurityToken, TokenFetchError, TokenStore};

/// Header carrying the CSRF token
pub const CSRF_HEADER: &str = "X-CSRF-Token";

const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    #[error("Could not obtain a CSRF token: {0}")]
    Token(#[from] TokenFetchError),

    #[error(transparent)]
    Http(#[from] HttpError),
}

/// Issues requests carrying a valid CSRF token.
///
/// Token rejections are reported back to the caller, never retried here.
#[derive(Clone)]
pub struct SecureRequestGate {
    tokens: TokenStore,
    transport: Arc<dyn HttpTransport>,
    header_name: String,
}

impl SecureRequestGate {
    pub fn new(tokens: TokenStore, transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_header_name(tokens, transport, CSRF_HEADER)
    }

    pub fn with_header_name(
        tokens: TokenStore,
        transport: Arc<dyn HttpTransport>,
        header_name: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            transport,
            header_name: header_name.into(),
        }
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Merge caller options with the default content type and the token header.
    ///
    /// Caller headers override the content type but never the token header.
    pub fn prepare(&self, token: &SecurityToken, options: FetchOptions) -> FetchOptions {
        let mut headers: HashMap<String, String> = HashMap::new();
        headers.insert("Content-Type".to_string(), DEFAULT_CONTENT_TYPE.to_string());

        for (name, value) in options.headers {
            if name.eq_ignore_ascii_case(&self.header_name) {
                debug!(header = %name, "Ignoring caller-supplied CSRF header");
                continue;
            }
            headers.retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
            headers.insert(name, value);
        }

        headers.insert(self.header_name.clone(), token.value.clone());

        FetchOptions { headers, ..options }
    }

    /// Send `options` to `url` with the current valid token attached
    pub async fn wrap(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, GateError> {
        let token = self.tokens.get_valid().await?;
        let prepared = self.prepare(&token, options);

        debug!(url, method = %prepared.method, "Sending request with CSRF token");
        let response = self.transport.fetch(url, prepared).await?;

        if Self::is_token_rejection(&response) {
            warn!(url, status = response.status, "Server rejected CSRF token");
        }
        Ok(response)
    }

    /// Whether the server refused the request because of its CSRF token
    pub fn is_token_rejection(response: &FetchResponse) -> bool {
        response.status == 403 && response.body.to_ascii_lowercase().contains("csrf")
    }
}

impl fmt::Debug for SecureRequestGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureRequestGate")
            .field("header_name", &self.header_name)
            .field("tokens", &self.tokens)
            .finish()
    }
}
