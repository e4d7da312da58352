// Secure Form
// Validates and sanitizes a set of fields before handing them to a submit handler

use indexmap::IndexMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::security::alerts::{AlertSeverity, SecurityAlertBus};
use crate::security::gate::SecureRequestGate;
use crate::security::token::TokenState;
use crate::security::validation::{InputGuard, InputKind};

pub const VALIDATION_ERRORS_TITLE: &str = "Validation errors";
pub const VALIDATION_ERRORS_MESSAGE: &str = "Check that the fields are filled in correctly";
pub const SUBMITTED_TITLE: &str = "Form submitted";
pub const SUBMITTED_MESSAGE: &str = "Data processed successfully";
pub const SUBMIT_FAILED_TITLE: &str = "Submission failed";
pub const SUBMIT_FAILED_MESSAGE: &str = "An error occurred while submitting the form";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormField {
    pub value: String,
    pub kind: InputKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("Form is already being submitted")]
    AlreadySubmitting,

    #[error("Security token is still loading")]
    TokenLoading,

    #[error("{} field(s) failed validation", .0.len())]
    Invalid(IndexMap<String, String>),

    #[error("Submission failed: {0}")]
    Handler(String),
}

#[derive(Default)]
struct FormState {
    fields: IndexMap<String, FormField>,
    errors: IndexMap<String, String>,
}

/// Clears the submitting flag when the submission ends, even if it is dropped midway
struct SubmitGuard<'a>(&'a AtomicBool);

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Form whose submission only ever sees validated, sanitized data
pub struct SecureForm {
    guard: InputGuard,
    gate: SecureRequestGate,
    alerts: SecurityAlertBus,
    live_validation: bool,
    state: Mutex<FormState>,
    submitting: AtomicBool,
}

impl SecureForm {
    pub fn new(guard: InputGuard, gate: SecureRequestGate, alerts: SecurityAlertBus) -> Self {
        Self {
            guard,
            gate,
            alerts,
            live_validation: true,
            state: Mutex::new(FormState::default()),
            submitting: AtomicBool::new(false),
        }
    }

    /// Validate fields as they change (enabled by default)
    pub fn with_live_validation(mut self, enabled: bool) -> Self {
        self.live_validation = enabled;
        self
    }

    fn lock(&self) -> MutexGuard<'_, FormState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a field value as given
    pub fn set_field(&self, name: impl Into<String>, value: impl Into<String>, kind: InputKind) {
        self.lock().fields.insert(
            name.into(),
            FormField {
                value: value.into(),
                kind,
            },
        );
    }

    /// Handle an edit: sanitize, store and, with live validation, update the field error.
    ///
    /// Returns the stored value.
    pub fn on_change(&self, name: &str, value: &str, kind: InputKind) -> String {
        let sanitized = self.guard.sanitize(value);
        let mut state = self.lock();

        if self.live_validation {
            let result = self.guard.validate(&sanitized, kind);
            if result.is_valid {
                state.errors.shift_remove(name);
            } else {
                state.errors.insert(name.to_string(), result.message);
            }
        }

        state.fields.insert(
            name.to_string(),
            FormField {
                value: sanitized.clone(),
                kind,
            },
        );
        sanitized
    }

    pub fn field(&self, name: &str) -> Option<FormField> {
        self.lock().fields.get(name).cloned()
    }

    pub fn errors(&self) -> IndexMap<String, String> {
        self.lock().errors.clone()
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    /// Validate every field, then pass the sanitized data and the gate to `handler`.
    ///
    /// Each outcome publishes one alert. A second call while one is running, or
    /// a call while the CSRF token is being fetched, is rejected without side
    /// effects.
    pub async fn submit<F, Fut, T, E>(&self, handler: F) -> Result<T, FormError>
    where
        F: FnOnce(IndexMap<String, String>, SecureRequestGate) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if self.gate.tokens().state() == TokenState::Fetching {
            debug!("Ignoring submit while the CSRF token is loading");
            return Err(FormError::TokenLoading);
        }

        if self
            .submitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Ignoring submit while a submission is in progress");
            return Err(FormError::AlreadySubmitting);
        }
        let _submitting = SubmitGuard(&self.submitting);

        let fields = self.lock().fields.clone();

        let errors: IndexMap<String, String> = fields
            .iter()
            .filter_map(|(name, field)| {
                let result = self.guard.validate(&field.value, field.kind);
                (!result.is_valid).then(|| (name.clone(), result.message))
            })
            .collect();

        self.lock().errors = errors.clone();

        if !errors.is_empty() {
            warn!(invalid_fields = errors.len(), "Form submission blocked by validation");
            self.alerts.publish(
                AlertSeverity::Warning,
                VALIDATION_ERRORS_TITLE,
                VALIDATION_ERRORS_MESSAGE,
            );
            return Err(FormError::Invalid(errors));
        }

        let data: IndexMap<String, String> = fields
            .into_iter()
            .map(|(name, field)| (name, self.guard.sanitize(&field.value)))
            .collect();

        match handler(data, self.gate.clone()).await {
            Ok(value) => {
                info!("Form submitted");
                self.alerts
                    .publish(AlertSeverity::Success, SUBMITTED_TITLE, SUBMITTED_MESSAGE);
                Ok(value)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "Form submission failed");
                let shown = if message.is_empty() {
                    SUBMIT_FAILED_MESSAGE.to_string()
                } else {
                    message.clone()
                };
                self.alerts
                    .publish(AlertSeverity::Error, SUBMIT_FAILED_TITLE, shown);
                Err(FormError::Handler(message))
            }
        }
    }
}

impl fmt::Debug for SecureForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("SecureForm")
            .field("fields", &state.fields.keys().collect::<Vec<_>>())
            .field("errors", &state.errors)
            .field("submitting", &self.is_submitting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::http_client::MockHttpTransport;
    use crate::scheduler::ManualScheduler;
    use crate::security::token::{
        MockTokenFetcher, TokenFetchError, TokenFetcher, TokenGrant, TokenStore,
    };
    use crate::security::validation::{EMAIL_MESSAGE, INJECTION_MESSAGE};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn form() -> (SecureForm, SecurityAlertBus) {
        form_with(Arc::new(MockTokenFetcher::new()))
    }

    fn form_with(fetcher: Arc<dyn TokenFetcher>) -> (SecureForm, SecurityAlertBus) {
        let clock = ManualClock::from_millis(1_700_000_000_000);
        let alerts = SecurityAlertBus::new(
            Duration::seconds(10),
            Arc::new(clock.clone()),
            Arc::new(ManualScheduler::new(clock.clone())),
        );
        let tokens = TokenStore::new(
            fetcher,
            Arc::new(MemoryStore::new()),
            Arc::new(clock),
            alerts.clone(),
            Duration::zero(),
        );
        let gate = SecureRequestGate::new(tokens, Arc::new(MockHttpTransport::new()));
        (
            SecureForm::new(InputGuard::new(), gate, alerts.clone()),
            alerts,
        )
    }

    #[test]
    fn test_on_change_sanitizes_and_validates() {
        let (form, _) = form();

        let stored = form.on_change("name", "  <b>Rex</b>  ", InputKind::Text);
        assert_eq!(stored, "bRex/b");
        assert!(form.errors().is_empty());

        form.on_change("email", "not-an-email", InputKind::Email);
        assert_eq!(form.errors().get("email").map(String::as_str), Some(EMAIL_MESSAGE));

        form.on_change("email", "rex@example.com", InputKind::Email);
        assert!(form.errors().is_empty());
    }

    #[test]
    fn test_live_validation_can_be_disabled() {
        let (form, _) = form();
        let form = form.with_live_validation(false);

        form.on_change("email", "nope", InputKind::Email);
        assert!(form.errors().is_empty());
        assert_eq!(form.field("email").unwrap().value, "nope");
    }

    #[tokio::test]
    async fn test_invalid_fields_block_handler() {
        let (form, alerts) = form();
        form.set_field("email", "nope", InputKind::Email);
        form.set_field("bio", "javascript:alert(1)", InputKind::Text);

        let result = form
            .submit(|_, _| async { Ok::<_, String>(()) })
            .await;

        let Err(FormError::Invalid(errors)) = result else {
            panic!("expected validation failure, got {result:?}");
        };
        assert_eq!(errors.get("email").map(String::as_str), Some(EMAIL_MESSAGE));
        assert_eq!(errors.get("bio").map(String::as_str), Some(INJECTION_MESSAGE));

        let listed = alerts.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].severity, AlertSeverity::Warning);
        assert_eq!(listed[0].title, VALIDATION_ERRORS_TITLE);
        assert!(!form.is_submitting());
    }

    #[tokio::test]
    async fn test_handler_receives_sanitized_data() {
        let (form, alerts) = form();
        form.set_field("email", "rex@example.com", InputKind::Email);
        form.set_field("name", "  Rex  ", InputKind::Text);

        let received = form
            .submit(|data, gate| async move {
                assert_eq!(gate.header_name(), "X-CSRF-Token");
                Ok::<_, String>(data)
            })
            .await
            .unwrap();

        assert_eq!(received.get("name").map(String::as_str), Some("Rex"));
        assert_eq!(
            received.keys().collect::<Vec<_>>(),
            vec!["email", "name"]
        );
        assert_eq!(alerts.list()[0].severity, AlertSeverity::Success);
        assert_eq!(alerts.list()[0].title, SUBMITTED_TITLE);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_alert() {
        let (form, alerts) = form();
        form.set_field("name", "Rex", InputKind::Text);

        let result = form
            .submit(|_, _| async { Err::<(), _>("backend unavailable") })
            .await;

        assert_eq!(
            result,
            Err(FormError::Handler("backend unavailable".to_string()))
        );
        let listed = alerts.list();
        assert_eq!(listed[0].severity, AlertSeverity::Error);
        assert_eq!(listed[0].title, SUBMIT_FAILED_TITLE);
        assert_eq!(listed[0].message, "backend unavailable");
    }

    #[tokio::test]
    async fn test_double_submit_rejected() {
        let (form, _) = form();
        form.set_field("name", "Rex", InputKind::Text);

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let first = form.submit(|_, _| async move {
            wait.await.ok();
            Ok::<_, String>(())
        });
        let second = async {
            tokio::task::yield_now().await;
            let result = form.submit(|_, _| async { Ok::<_, String>(()) }).await;
            release.send(()).ok();
            result
        };

        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert_eq!(second, Err(FormError::AlreadySubmitting));
        assert!(!form.is_submitting());
    }

    /// Answers only once the test releases it
    struct HeldFetcher {
        release: Mutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl TokenFetcher for HeldFetcher {
        async fn fetch_token(&self) -> Result<TokenGrant, TokenFetchError> {
            let wait = self.release.lock().unwrap().take();
            if let Some(wait) = wait {
                wait.await.ok();
            }
            Ok(TokenGrant {
                csrf_token: "late".to_string(),
                expires_in: 3600,
            })
        }
    }

    #[tokio::test]
    async fn test_submit_refused_while_token_loading() {
        let (release, wait) = oneshot::channel::<()>();
        let (form, alerts) = form_with(Arc::new(HeldFetcher {
            release: Mutex::new(Some(wait)),
        }));
        form.set_field("name", "Rex", InputKind::Text);
        let tokens = form.gate.tokens().clone();
        let called = AtomicBool::new(false);

        let fetch = tokens.get_valid();
        let attempt = async {
            tokio::task::yield_now().await;
            assert_eq!(tokens.state(), TokenState::Fetching);
            let result = form
                .submit(|_, _| async {
                    called.store(true, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
                .await;
            release.send(()).ok();
            result
        };

        let (fetched, attempt) = tokio::join!(fetch, attempt);
        assert_eq!(fetched.unwrap().value, "late");
        assert_eq!(attempt, Err(FormError::TokenLoading));
        assert!(!called.load(Ordering::SeqCst));
        assert!(alerts.is_empty());
        assert!(!form.is_submitting());

        // once the token has arrived the form submits normally
        let result = form.submit(|_, _| async { Ok::<_, String>(()) }).await;
        assert!(result.is_ok());
    }
}
