// CSRF Token Lifecycle Module
// Caches the anti-forgery token, mirrors it into durable storage and coalesces refetches

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::http_client::{FetchOptions, HttpError, HttpTransport};
use crate::security::alerts::{AlertSeverity, SecurityAlertBus};
use crate::storage::KeyValueStore;

/// Storage key holding the token value
pub const TOKEN_KEY: &str = "csrf_token";
/// Storage key holding the absolute expiry in epoch milliseconds
pub const TOKEN_EXPIRES_KEY: &str = "csrf_token_expires";

pub const DEFAULT_TOKEN_PATH: &str = "/api/csrf-token";

/// Longest lifetime accepted from the token endpoint (ten years)
pub const MAX_TOKEN_TTL_SECS: i64 = 10 * 365 * 24 * 60 * 60;

pub const FETCH_FAILED_TITLE: &str = "Security problem";
pub const FETCH_FAILED_MESSAGE: &str = "Failed to obtain a security token";

/// Anti-forgery token with its validity window
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: i64,
    pub expires_at: DateTime<Utc>,
}

impl SecurityToken {
    /// Token valid for `ttl_seconds` from `issued_at`.
    ///
    /// `None` when the expiry falls outside the representable date range.
    pub fn issue(
        value: impl Into<String>,
        issued_at: DateTime<Utc>,
        ttl_seconds: i64,
    ) -> Option<Self> {
        let expires_at = Duration::try_seconds(ttl_seconds)
            .and_then(|ttl| issued_at.checked_add_signed(ttl))?;
        Some(Self {
            value: value.into(),
            issued_at,
            ttl_seconds,
            expires_at,
        })
    }

    /// Rebuild a token known only by value and absolute expiry.
    ///
    /// The TTL is the whole seconds remaining at `now`; `issued_at` is derived
    /// from it so that `expires_at == issued_at + ttl_seconds` still holds.
    pub fn restore(value: impl Into<String>, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let ttl_seconds = (expires_at - now).num_seconds().max(0);
        Self {
            value: value.into(),
            issued_at: expires_at - Duration::seconds(ttl_seconds),
            ttl_seconds,
            expires_at,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

impl fmt::Debug for SecurityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Body returned by the token endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub csrf_token: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenFetchError {
    #[error("Token endpoint unreachable: {0}")]
    Transport(String),

    #[error("Token endpoint returned status {status}")]
    Status { status: u16 },

    #[error("Malformed token response: {0}")]
    Malformed(String),
}

impl From<HttpError> for TokenFetchError {
    fn from(err: HttpError) -> Self {
        TokenFetchError::Transport(err.to_string())
    }
}

/// Source of fresh tokens
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self) -> Result<TokenGrant, TokenFetchError>;
}

/// Fetches tokens with a plain GET against the token endpoint
pub struct HttpTokenFetcher {
    transport: Arc<dyn HttpTransport>,
    endpoint: String,
}

impl HttpTokenFetcher {
    pub fn new(transport: Arc<dyn HttpTransport>, endpoint: impl Into<String>) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    async fn fetch_token(&self) -> Result<TokenGrant, TokenFetchError> {
        let options = FetchOptions::default().with_header("Accept", "application/json");
        let response = self.transport.fetch(&self.endpoint, options).await?;

        if !response.ok {
            return Err(TokenFetchError::Status {
                status: response.status,
            });
        }

        let grant: TokenGrant = response
            .json()
            .map_err(|e| TokenFetchError::Malformed(e.to_string()))?;

        if grant.csrf_token.is_empty() {
            return Err(TokenFetchError::Malformed("empty csrf_token".to_string()));
        }
        if grant.expires_in <= 0 {
            return Err(TokenFetchError::Malformed(format!(
                "non-positive expires_in: {}",
                grant.expires_in
            )));
        }
        if grant.expires_in > MAX_TOKEN_TTL_SECS {
            return Err(TokenFetchError::Malformed(format!(
                "expires_in out of range: {}",
                grant.expires_in
            )));
        }

        Ok(grant)
    }
}

/// Observable lifecycle state of the cached token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TokenState {
    Missing,
    Fetching,
    Valid,
    Expired,
}

type SharedFetch = Shared<BoxFuture<'static, Result<SecurityToken, TokenFetchError>>>;

#[derive(Default)]
struct TokenSlot {
    token: Option<SecurityToken>,
    in_flight: Option<SharedFetch>,
    background: Option<JoinHandle<()>>,
}

struct StoreInner {
    slot: Mutex<TokenSlot>,
    fetcher: Arc<dyn TokenFetcher>,
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    alerts: SecurityAlertBus,
    refresh_margin: Duration,
    fetches: AtomicU64,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, TokenSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn refresh(self: Arc<Self>) -> Result<SecurityToken, TokenFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        debug!("Fetching CSRF token");

        let fetched = self.fetcher.fetch_token().await;
        let now = self.clock.now();
        let fetched = fetched.and_then(|grant| {
            let expires_in = grant.expires_in;
            SecurityToken::issue(grant.csrf_token, now, expires_in).ok_or_else(|| {
                TokenFetchError::Malformed(format!("expires_in out of range: {expires_in}"))
            })
        });

        let mut slot = self.lock();
        slot.in_flight = None;

        match fetched {
            Ok(token) => {
                slot.token = Some(token.clone());
                // storage is written only after the slot lock is released
                drop(slot);
                self.persist(&token);
                info!(expires_at = %token.expires_at, ttl_seconds = token.ttl_seconds, "CSRF token refreshed");
                Ok(token)
            }
            Err(e) => {
                if slot.token.as_ref().is_some_and(|t| t.is_valid_at(now)) {
                    warn!(error = %e, "CSRF token refresh failed, keeping current token");
                    return Err(e);
                }

                slot.token = None;
                drop(slot);
                self.clear_persisted();

                warn!(error = %e, "CSRF token fetch failed");
                self.alerts
                    .publish(AlertSeverity::Warning, FETCH_FAILED_TITLE, FETCH_FAILED_MESSAGE);
                Err(e)
            }
        }
    }

    fn persist(&self, token: &SecurityToken) {
        let expires = token.expires_at.timestamp_millis().to_string();
        let written = self
            .storage
            .set(TOKEN_KEY, &token.value)
            .and_then(|_| self.storage.set(TOKEN_EXPIRES_KEY, &expires));

        if let Err(e) = written {
            warn!(error = %e, "Failed to persist CSRF token");
            // never leave one key without the other
            self.clear_persisted();
        }
    }

    fn clear_persisted(&self) {
        for key in [TOKEN_KEY, TOKEN_EXPIRES_KEY] {
            if let Err(e) = self.storage.remove(key) {
                debug!(key, error = %e, "Failed to clear persisted CSRF token");
            }
        }
    }

    fn load_persisted(&self, now: DateTime<Utc>) -> Option<SecurityToken> {
        let value = self.storage.get(TOKEN_KEY).ok().flatten();
        let expires = self.storage.get(TOKEN_EXPIRES_KEY).ok().flatten();

        let (Some(value), Some(expires)) = (value, expires) else {
            return None;
        };

        let expires_at = expires
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())?;

        if value.is_empty() || now >= expires_at {
            return None;
        }
        Some(SecurityToken::restore(value, expires_at, now))
    }
}

/// Owner of the current CSRF token.
///
/// Concurrent callers needing a fetch share one in-flight future, so the token
/// endpoint sees a single request no matter how many callers are waiting.
/// Clones share the same state.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<StoreInner>,
}

impl TokenStore {
    /// Create the store and restore a still-valid token from storage, if any
    pub fn new(
        fetcher: Arc<dyn TokenFetcher>,
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        alerts: SecurityAlertBus,
        refresh_margin: Duration,
    ) -> Self {
        let inner = Arc::new(StoreInner {
            slot: Mutex::new(TokenSlot::default()),
            fetcher,
            storage,
            clock,
            alerts,
            refresh_margin,
            fetches: AtomicU64::new(0),
        });

        let now = inner.clock.now();
        match inner.load_persisted(now) {
            Some(token) => {
                debug!(expires_at = %token.expires_at, "Restored CSRF token from storage");
                inner.lock().token = Some(token);
            }
            None => inner.clear_persisted(),
        }

        Self { inner }
    }

    /// Return a token valid right now, fetching one if necessary
    pub async fn get_valid(&self) -> Result<SecurityToken, TokenFetchError> {
        let pending = {
            let mut slot = self.inner.lock();
            let now = self.inner.clock.now();

            if slot.token.as_ref().is_none_or(|t| !t.is_valid_at(now))
                && let Some(stored) = self.inner.load_persisted(now)
            {
                debug!("Picked up CSRF token from storage");
                slot.token = Some(stored);
            }

            if let Some(token) = slot.token.clone().filter(|t| t.is_valid_at(now)) {
                if self.needs_early_refresh(&token, now) && slot.in_flight.is_none() {
                    self.spawn_background_refresh(&mut slot);
                }
                return Ok(token);
            }

            match slot.in_flight.clone() {
                Some(pending) => {
                    debug!("Joining in-flight CSRF token fetch");
                    pending
                }
                None => self.start_fetch(&mut slot),
            }
        };

        pending.await
    }

    /// Drop the cached token and its storage mirror
    pub fn invalidate(&self) {
        self.inner.lock().token = None;
        self.inner.clear_persisted();
        info!("CSRF token invalidated");
    }

    pub fn state(&self) -> TokenState {
        let slot = self.inner.lock();
        let now = self.inner.clock.now();

        match &slot.token {
            Some(token) if token.is_valid_at(now) => TokenState::Valid,
            _ if slot.in_flight.is_some() => TokenState::Fetching,
            Some(_) => TokenState::Expired,
            None => TokenState::Missing,
        }
    }

    /// Cached token, even if expired
    pub fn current(&self) -> Option<SecurityToken> {
        self.inner.lock().token.clone()
    }

    /// Number of fetches issued against the token endpoint
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Abort any background refresh task
    pub fn dispose(&self) {
        if let Some(task) = self.inner.lock().background.take() {
            task.abort();
        }
    }

    fn needs_early_refresh(&self, token: &SecurityToken, now: DateTime<Utc>) -> bool {
        self.inner.refresh_margin > Duration::zero()
            && token.remaining(now) <= self.inner.refresh_margin
    }

    fn start_fetch(&self, slot: &mut TokenSlot) -> SharedFetch {
        let inner = self.inner.clone();
        let pending = inner.refresh().boxed().shared();
        slot.in_flight = Some(pending.clone());
        pending
    }

    fn spawn_background_refresh(&self, slot: &mut TokenSlot) {
        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime for background CSRF refresh");
            return;
        };

        let pending = self.start_fetch(slot);
        debug!("Starting background CSRF token refresh");
        slot.background = Some(runtime.spawn(pending.map(|_| ())));
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("state", &self.state())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}
