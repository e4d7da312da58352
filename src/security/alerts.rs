// Security Alert Bus
// Transient, time-bounded log of security events surfaced to the user

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::scheduler::{TaskScheduler, TimerHandle};

/// Lifetime of an alert before automatic removal
pub const DEFAULT_ALERT_TTL_MS: u64 = 10_000;

const EVENT_CHANNEL_CAPACITY: usize = 64;

static NEXT_ALERT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique alert identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(u64);

impl AlertId {
    fn next() -> Self {
        Self(NEXT_ALERT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alert-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Success,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Success => "success",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub id: AlertId,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl SecurityAlert {
    /// Follow-up advice a display surface may show under the alert
    pub fn hint(&self) -> Option<&'static str> {
        match self.severity {
            AlertSeverity::Warning if self.title.to_lowercase().contains("browser") => {
                Some("Use a modern browser with cookies and JavaScript enabled")
            }
            AlertSeverity::Error if self.message.contains("CSRF") => {
                Some("Refresh the page and try again")
            }
            AlertSeverity::Error if self.message.contains("XSS") => {
                Some("Check the entered data for special characters")
            }
            _ => None,
        }
    }
}

/// Change notification for subscribers re-rendering the alert list
#[derive(Debug, Clone, PartialEq)]
pub enum AlertEvent {
    Published(SecurityAlert),
    Dismissed(AlertId),
    Expired(AlertId),
}

#[derive(Default)]
struct BusState {
    alerts: Vec<SecurityAlert>,
    timers: HashMap<AlertId, TimerHandle>,
    disposed: bool,
}

struct BusInner {
    state: Mutex<BusState>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn TaskScheduler>,
    events: broadcast::Sender<AlertEvent>,
}

impl BusInner {
    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire(&self, id: AlertId) {
        let removed = {
            let mut state = self.lock();
            state.timers.remove(&id);
            remove_alert(&mut state.alerts, id)
        };

        if removed {
            debug!(alert_id = %id, "Security alert expired");
            let _ = self.events.send(AlertEvent::Expired(id));
        }
    }
}

fn remove_alert(alerts: &mut Vec<SecurityAlert>, id: AlertId) -> bool {
    let before = alerts.len();
    alerts.retain(|alert| alert.id != id);
    alerts.len() != before
}

/// Publish/subscribe log of transient security alerts.
///
/// Each alert is removed automatically once its TTL elapses, or earlier on
/// [`SecurityAlertBus::dismiss`]. Clones share the same collection.
#[derive(Clone)]
pub struct SecurityAlertBus {
    inner: Arc<BusInner>,
}

impl SecurityAlertBus {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>, scheduler: Arc<dyn TaskScheduler>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState::default()),
                ttl,
                clock,
                scheduler,
                events,
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Record a new alert and schedule its removal; returns without waiting
    pub fn publish(
        &self,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> AlertId {
        let alert = SecurityAlert {
            id: AlertId::next(),
            severity,
            title: title.into(),
            message: message.into(),
            created_at: self.inner.clock.now(),
        };
        let id = alert.id;

        match severity {
            AlertSeverity::Info | AlertSeverity::Success => {
                info!(alert_id = %id, severity = %severity, title = %alert.title, "Security alert published");
            }
            AlertSeverity::Warning => {
                warn!(
                    alert_id = %id,
                    title = %alert.title,
                    message = %alert.message,
                    "Security warning published"
                );
            }
            AlertSeverity::Error => {
                error!(
                    alert_id = %id,
                    title = %alert.title,
                    message = %alert.message,
                    "Security error published"
                );
            }
        }

        {
            let mut state = self.inner.lock();
            if state.disposed {
                debug!(alert_id = %id, "Alert bus disposed, alert dropped");
                return id;
            }

            state.alerts.push(alert.clone());

            let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
            let delay = self.inner.ttl.to_std().unwrap_or_default();
            let handle = self.inner.scheduler.schedule(
                delay,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.expire(id);
                    }
                }),
            );
            state.timers.insert(id, handle);
        }

        let _ = self.inner.events.send(AlertEvent::Published(alert));
        id
    }

    /// Remove an alert now; unknown or already removed ids are ignored.
    ///
    /// Returns whether an alert was removed.
    pub fn dismiss(&self, id: AlertId) -> bool {
        let removed = {
            let mut state = self.inner.lock();
            if let Some(timer) = state.timers.remove(&id) {
                timer.cancel();
            }
            remove_alert(&mut state.alerts, id)
        };

        if removed {
            debug!(alert_id = %id, "Security alert dismissed");
            let _ = self.inner.events.send(AlertEvent::Dismissed(id));
        }
        removed
    }

    /// Live alerts, oldest first
    pub fn list(&self) -> Vec<SecurityAlert> {
        let now = self.inner.clock.now();
        let ttl = self.inner.ttl;

        let (alerts, expired) = {
            let mut state = self.inner.lock();
            let mut expired = Vec::new();

            // timers may lag behind the clock
            state.alerts.retain(|alert| {
                let live = now < alert.created_at + ttl;
                if !live {
                    expired.push(alert.id);
                }
                live
            });
            for id in &expired {
                if let Some(timer) = state.timers.remove(id) {
                    timer.cancel();
                }
            }

            (state.alerts.clone(), expired)
        };

        for id in expired {
            let _ = self.inner.events.send(AlertEvent::Expired(id));
        }
        alerts
    }

    pub fn get(&self, id: AlertId) -> Option<SecurityAlert> {
        self.list().into_iter().find(|alert| alert.id == id)
    }

    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive a notification for every publish, dismissal and expiry
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.inner.events.subscribe()
    }

    /// Number of auto-removal timers still outstanding
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Cancel every pending removal and clear the collection.
    ///
    /// Later publishes are logged and dropped.
    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        state.disposed = true;

        let cancelled = state.timers.len();
        for (_, timer) in state.timers.drain() {
            timer.cancel();
        }
        state.alerts.clear();

        debug!(cancelled_timers = cancelled, "Alert bus disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }
}

impl fmt::Debug for SecurityAlertBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SecurityAlertBus")
            .field("ttl", &self.inner.ttl)
            .field("alerts", &state.alerts.len())
            .field("disposed", &state.disposed)
            .finish()
    }
}
