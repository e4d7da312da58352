use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::{Host, Url};

use crate::security::alerts::{AlertSeverity, SecurityAlertBus};
use crate::storage::KeyValueStore;

pub const BROWSER_ALERT_TITLE: &str = "Browser security issues";

pub const ISSUE_INSECURE_TRANSPORT: &str = "Connection is not protected by HTTPS";
pub const ISSUE_STORAGE_UNAVAILABLE: &str = "Local storage is unavailable";
pub const ISSUE_COOKIES_DISABLED: &str = "Cookies are disabled";

/// Facts about the environment the guard runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEnvironment {
    /// Origin the application is served from
    pub origin: Url,
    pub cookies_enabled: bool,
}

impl ClientEnvironment {
    pub fn new(origin: Url, cookies_enabled: bool) -> Self {
        Self {
            origin,
            cookies_enabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityChecks {
    pub https: bool,
    pub storage: bool,
    pub cookies: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserSecurityReport {
    pub is_secure: bool,
    pub issues: Vec<String>,
    pub checks: SecurityChecks,
}

/// Whether `url` points at a local development host
pub fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// One-shot check of the execution environment.
///
/// Findings are reported as a single warning alert; none of them block anything.
#[derive(Debug, Clone)]
pub struct BrowserSecurityAuditor {
    alerts: SecurityAlertBus,
}

impl BrowserSecurityAuditor {
    pub fn new(alerts: SecurityAlertBus) -> Self {
        Self { alerts }
    }

    pub fn run(
        &self,
        environment: &ClientEnvironment,
        storage: &dyn KeyValueStore,
    ) -> BrowserSecurityReport {
        let checks = SecurityChecks {
            https: environment.origin.scheme() == "https",
            storage: storage.is_available(),
            cookies: environment.cookies_enabled,
        };

        let mut issues = Vec::new();
        if !checks.https && !is_loopback_host(&environment.origin) {
            issues.push(ISSUE_INSECURE_TRANSPORT.to_string());
        }
        if !checks.storage {
            issues.push(ISSUE_STORAGE_UNAVAILABLE.to_string());
        }
        if !checks.cookies {
            issues.push(ISSUE_COOKIES_DISABLED.to_string());
        }

        if issues.is_empty() {
            info!(origin = %environment.origin, "Environment security checks passed");
        } else {
            warn!(
                origin = %environment.origin,
                issues = ?issues,
                "Environment security issues detected"
            );
            self.alerts
                .publish(AlertSeverity::Warning, BROWSER_ALERT_TITLE, issues.join(", "));
        }

        BrowserSecurityReport {
            is_secure: issues.is_empty(),
            issues,
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::ManualScheduler;
    use crate::storage::MemoryStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn auditor() -> (BrowserSecurityAuditor, SecurityAlertBus) {
        let clock = ManualClock::from_millis(0);
        let bus = SecurityAlertBus::new(
            Duration::seconds(10),
            Arc::new(clock.clone()),
            Arc::new(ManualScheduler::new(clock)),
        );
        (BrowserSecurityAuditor::new(bus.clone()), bus)
    }

    fn env(origin: &str, cookies: bool) -> ClientEnvironment {
        ClientEnvironment::new(Url::parse(origin).unwrap(), cookies)
    }

    #[test]
    fn test_secure_environment_publishes_nothing() {
        let (auditor, bus) = auditor();
        let report = auditor.run(&env("https://app.example.com", true), &MemoryStore::new());

        assert!(report.is_secure);
        assert!(report.issues.is_empty());
        assert_eq!(
            report.checks,
            SecurityChecks {
                https: true,
                storage: true,
                cookies: true
            }
        );
        assert!(bus.is_empty());
    }

    #[test]
    fn test_all_issues_reported_in_one_alert() {
        let (auditor, bus) = auditor();
        let report = auditor.run(
            &env("http://app.example.com", false),
            &MemoryStore::unavailable(),
        );

        assert!(!report.is_secure);
        assert_eq!(
            report.issues,
            vec![
                ISSUE_INSECURE_TRANSPORT.to_string(),
                ISSUE_STORAGE_UNAVAILABLE.to_string(),
                ISSUE_COOKIES_DISABLED.to_string(),
            ]
        );

        let alerts = bus.list();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(alerts[0].title, BROWSER_ALERT_TITLE);
        assert!(alerts[0].message.contains(ISSUE_COOKIES_DISABLED));
    }

    #[test]
    fn test_loopback_hosts_exempt_from_https() {
        for origin in [
            "http://localhost:5173",
            "http://127.0.0.1:8080",
            "http://[::1]:3000",
            "http://app.localhost",
        ] {
            let (auditor, bus) = auditor();
            let report = auditor.run(&env(origin, true), &MemoryStore::new());
            assert!(report.is_secure, "{origin}");
            assert!(!report.checks.https);
            assert!(bus.is_empty());
        }
    }

    #[test]
    fn test_lookalike_host_not_exempt() {
        let url = Url::parse("http://localhost.evil.com").unwrap();
        assert!(!is_loopback_host(&url));
    }
}
