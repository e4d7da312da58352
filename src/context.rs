//! Security Context
//!
//! Wires the token store, alert bus, input guard, request gate and environment
//! auditor together. The application builds one context at startup and shares
//! it by `Arc`; every consumer goes through it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::error::GuardResult;
use crate::http_client::{FetchOptions, FetchResponse, HttpClient, HttpTransport};
use crate::scheduler::{TaskScheduler, TokioScheduler};
use crate::security::alerts::SecurityAlertBus;
use crate::security::audit::{BrowserSecurityAuditor, BrowserSecurityReport, ClientEnvironment};
use crate::security::form::SecureForm;
use crate::security::gate::{GateError, SecureRequestGate};
use crate::security::token::{HttpTokenFetcher, TokenState, TokenStore};
use crate::security::validation::{InputGuard, InputKind, ValidationResult};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};

/// Collaborators the context runs on
pub struct ContextDeps {
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub storage: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn HttpTransport>,
    pub environment: ClientEnvironment,
}

impl ContextDeps {
    /// Production collaborators: system clock, tokio timers, reqwest transport.
    ///
    /// A storage file that cannot be opened leaves the context without durable
    /// storage, which the auditor then reports.
    pub fn from_config(config: &GuardConfig) -> GuardResult<Self> {
        let base_url = config.base_url()?;

        let transport = HttpClient::with_settings(
            Some(base_url.clone()),
            config.request_timeout(),
            config.max_response_size,
        )?;

        let storage: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => match FileStore::open(path) {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Token storage unavailable");
                    Arc::new(MemoryStore::unavailable())
                }
            },
            None => Arc::new(MemoryStore::new()),
        };

        Ok(Self {
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler::new()),
            storage,
            transport: Arc::new(transport),
            environment: ClientEnvironment::new(base_url, config.cookies_enabled),
        })
    }
}

/// Single entry point to the guard layer
pub struct SecurityContext {
    config: GuardConfig,
    guard: InputGuard,
    alerts: SecurityAlertBus,
    tokens: TokenStore,
    gate: SecureRequestGate,
    report: BrowserSecurityReport,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl SecurityContext {
    /// Build every component, restore the persisted token, audit the
    /// environment once and, if configured, prefetch a token.
    pub fn initialize(config: GuardConfig, deps: ContextDeps) -> GuardResult<Arc<Self>> {
        config.validate()?;

        let alerts = SecurityAlertBus::new(config.alert_ttl(), deps.clock.clone(), deps.scheduler);
        let fetcher = HttpTokenFetcher::new(deps.transport.clone(), config.token_path.clone());
        let tokens = TokenStore::new(
            Arc::new(fetcher),
            deps.storage.clone(),
            deps.clock,
            alerts.clone(),
            config.refresh_margin(),
        );
        let gate = SecureRequestGate::with_header_name(
            tokens.clone(),
            deps.transport,
            config.csrf_header.clone(),
        );

        let report =
            BrowserSecurityAuditor::new(alerts.clone()).run(&deps.environment, deps.storage.as_ref());

        let context = Arc::new(Self {
            guard: InputGuard::with_max_length(config.max_input_length),
            config,
            alerts,
            tokens,
            gate,
            report,
            tasks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        if context.config.prefetch_on_start {
            context.spawn_prefetch();
        }

        info!(
            token_state = ?context.tokens.state(),
            secure = context.report.is_secure,
            "Security context initialized"
        );
        Ok(context)
    }

    fn spawn_prefetch(&self) {
        if self.tokens.state() == TokenState::Valid {
            debug!("Persisted CSRF token still valid, skipping prefetch");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            debug!("No runtime, CSRF token will be fetched on first use");
            return;
        };

        let tokens = self.tokens.clone();
        let task = runtime.spawn(async move {
            if let Err(e) = tokens.get_valid().await {
                debug!(error = %e, "CSRF token prefetch failed");
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    pub fn validate(&self, input: &str, kind: InputKind) -> ValidationResult {
        self.guard.validate(input, kind)
    }

    pub fn sanitize(&self, input: &str) -> String {
        self.guard.sanitize(input)
    }

    /// Send a request carrying the current CSRF token
    pub async fn wrap(&self, url: &str, options: FetchOptions) -> Result<FetchResponse, GateError> {
        self.gate.wrap(url, options).await
    }

    /// Like [`wrap`](Self::wrap), but on a CSRF rejection invalidate the token
    /// and send the request exactly once more.
    pub async fn wrap_retrying_once(
        &self,
        url: &str,
        options: FetchOptions,
    ) -> Result<FetchResponse, GateError> {
        let response = self.gate.wrap(url, options.clone()).await?;
        if !SecureRequestGate::is_token_rejection(&response) {
            return Ok(response);
        }

        info!(url, "Retrying request with a fresh CSRF token");
        self.tokens.invalidate();
        self.gate.wrap(url, options).await
    }

    /// Form bound to this context's guard, gate and alerts
    pub fn secure_form(&self) -> SecureForm {
        SecureForm::new(self.guard.clone(), self.gate.clone(), self.alerts.clone())
    }

    pub fn alerts(&self) -> &SecurityAlertBus {
        &self.alerts
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn gate(&self) -> &SecureRequestGate {
        &self.gate
    }

    pub fn guard(&self) -> &InputGuard {
        &self.guard
    }

    /// Environment report from initialization
    pub fn report(&self) -> &BrowserSecurityReport {
        &self.report
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Cancel background tasks and alert timers, and clear the alert list
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }

        self.tokens.dispose();
        self.alerts.dispose();
        info!(aborted_tasks = tasks.len(), "Security context disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("tokens", &self.tokens)
            .field("alerts", &self.alerts)
            .field("secure", &self.report.is_secure)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
