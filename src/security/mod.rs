pub mod alerts;
pub mod audit;
pub mod form;
pub mod gate;
pub mod token;
pub mod validation;

pub use alerts::{AlertEvent, AlertId, AlertSeverity, SecurityAlert, SecurityAlertBus};
pub use audit::{BrowserSecurityAuditor, BrowserSecurityReport, ClientEnvironment, SecurityChecks};
pub use form::{FormError, FormField, SecureForm};
pub use gate::{CSRF_HEADER, GateError, SecureRequestGate};
pub use token::{
    HttpTokenFetcher, SecurityToken, TokenFetchError, TokenFetcher, TokenGrant, TokenState,
    TokenStore,
};
pub use validation::{
    InputGuard, InputKind, RejectReason, ValidationResult, ValidationRule, sanitize, validate,
};
