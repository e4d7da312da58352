//! Client-side security guard layer.
//!
//! Keeps a short-lived CSRF token fresh, attaches it to outgoing requests,
//! rejects dangerous input before it reaches business logic and keeps a
//! transient log of security alerts for display.
//!
//! Everything is reached through [`SecurityContext`], built once at startup:
//!
//! ```no_run
//! # async fn demo() -> dinoguard::GuardResult<()> {
//! use dinoguard::{ContextDeps, FetchOptions, GuardConfig, InputKind, SecurityContext};
//!
//! let config = GuardConfig::load(None)?;
//! let deps = ContextDeps::from_config(&config)?;
//! let context = SecurityContext::initialize(config, deps)?;
//!
//! if context.validate("user@example.com", InputKind::Email).is_valid {
//!     context.wrap("/api/profile", FetchOptions::post()).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod http_client;
pub mod scheduler;
pub mod security;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, GuardConfig};
pub use context::{ContextDeps, SecurityContext};
pub use error::{GuardError, GuardResult};
pub use http_client::{FetchOptions, FetchResponse, HttpClient, HttpError, HttpTransport};
pub use scheduler::{ManualScheduler, TaskScheduler, TimerHandle, TokioScheduler};
pub use security::{
    AlertEvent, AlertId, AlertSeverity, BrowserSecurityReport, ClientEnvironment, GateError,
    InputGuard, InputKind, SecureForm, SecureRequestGate, SecurityAlert, SecurityAlertBus,
    TokenFetchError, TokenState, TokenStore, ValidationResult,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
