//! Per-address request limiting for guarded paths, with escalating lockout.
//!
//! Each address moves between three states:
//! - normal: under the per-window limit, requests pass;
//! - throttled: at or over the limit, rejected until the window rolls over.
//!   The first rejection in a window counts one violation;
//! - locked: violations reached the threshold, everything is refused until
//!   the lockout passes. The next check after that clears the lock and the
//!   violation history.
//!
//! A failing store never blocks traffic: checks fail open and log at error
//! level.

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::errors::AuthError;
use crate::storage::Storage;
use crate::window::{SlidingLog, WindowCounter};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `count` is the number of requests already recorded in this window.
    Allow { count: u32 },
    Throttle { retry_after_secs: u64 },
    Locked { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// Decides which request paths the limiter applies to. Exempt prefixes win
/// over guarded ones.
#[derive(Debug, Clone)]
pub struct PathGuard {
    guarded: Vec<String>,
    exempt: Vec<String>,
}

impl PathGuard {
    pub fn new(guarded: Vec<String>, exempt: Vec<String>) -> Self {
        Self { guarded, exempt }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.guarded_prefixes.clone(),
            config.exempt_prefixes.clone(),
        )
    }

    pub fn is_guarded(&self, path: &str) -> bool {
        if self.exempt.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return false;
        }
        self.guarded
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Store key subject for an address: the first 16 hex characters of its
/// SHA-256, so raw addresses never reach the store or the logs.
pub fn address_subject(addr: &IpAddr) -> String {
    let digest = Sha256::digest(addr.to_string().as_bytes());
    let mut subject = hex::encode(digest);
    subject.truncate(16);
    subject
}

/// Best-effort client address: the first hop of `X-Forwarded-For` when it
/// parses, otherwise the direct peer.
pub fn client_address(forwarded_for: Option<&str>, peer: Option<IpAddr>) -> Option<IpAddr> {
    forwarded_for
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .and_then(|first| first.parse().ok())
        .or(peer)
}

pub struct RateLimiter {
    config: RateLimitConfig,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    requests: WindowCounter,
    throttled: WindowCounter,
    violations: SlidingLog,
}

impl RateLimiter {
    pub fn new(storage: Arc<dyn Storage>, config: RateLimitConfig) -> Self {
        Self::with_clock(storage, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        storage: Arc<dyn Storage>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let requests = WindowCounter::new(
            storage.clone(),
            clock.clone(),
            "admin_requests",
            config.window_seconds,
        );
        let throttled = WindowCounter::new(
            storage.clone(),
            clock.clone(),
            "admin_throttled",
            config.window_seconds,
        );
        let violations = SlidingLog::new(
            storage.clone(),
            clock.clone(),
            "admin_violations",
            config.violation_window_seconds,
        );
        Self {
            config,
            storage,
            clock,
            requests,
            throttled,
            violations,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock_key(subject: &str) -> String {
        format!("admin_lockout:{}", subject)
    }

    /// Remaining lockout, clearing an elapsed one together with the
    /// violation history.
    async fn active_lock(&self, subject: &str, now: DateTime<Utc>) -> Result<Option<u64>, AuthError> {
        let lock_key = Self::lock_key(subject);
        let Some(until) = self.storage.get_marker(&lock_key).await? else {
            return Ok(None);
        };
        if now < until {
            let remaining = u64::try_from((until - now).num_seconds()).unwrap_or(0);
            return Ok(Some(remaining.max(1)));
        }

        self.storage.delete_marker(&lock_key).await?;
        self.violations.clear(subject).await?;
        debug!(subject, "Lockout elapsed, violation history cleared");
        Ok(None)
    }

    async fn try_check(&self, subject: &str) -> Result<Decision, AuthError> {
        let now = self.clock.now();
        if let Some(retry_after_secs) = self.active_lock(subject, now).await? {
            return Ok(Decision::Locked { retry_after_secs });
        }

        let count = self.requests.count(subject).await?;
        if count >= self.config.max_requests {
            return Ok(Decision::Throttle {
                retry_after_secs: self.requests.secs_until_reset(),
            });
        }
        Ok(Decision::Allow { count })
    }

    /// Decides without recording anything apart from clearing an elapsed
    /// lockout. Two calls with no request recorded in between see the same
    /// count.
    pub async fn check(&self, addr: &IpAddr) -> Decision {
        let subject = address_subject(addr);
        match self.try_check(&subject).await {
            Ok(decision) => decision,
            Err(e) => {
                error!(subject = %subject, error = %e, "Rate limit store unavailable, allowing request");
                Decision::Allow { count: 0 }
            }
        }
    }

    /// Counts a served request against the address's current window.
    pub async fn record(&self, addr: &IpAddr) {
        let subject = address_subject(addr);
        let recorded = async {
            self.requests.increment(&subject).await?;
            self.requests.evict_stale(&subject).await
        };
        if let Err(e) = recorded.await {
            error!(subject = %subject, error = %e, "Failed to record request");
        }
    }

    async fn try_record_violation(&self, subject: &str) -> Result<(), AuthError> {
        // one violation per throttled window, however many requests it rejects
        if self.throttled.increment(subject).await? > 1 {
            return Ok(());
        }

        let violations = self.violations.record(subject).await?;
        warn!(subject, violations, "Rate limit exceeded");

        if violations >= self.config.max_violations {
            let lockout = self.config.lockout_seconds;
            let until = self.clock.now()
                + Duration::seconds(i64::try_from(lockout).unwrap_or(i64::MAX / 1000));
            self.storage
                .set_marker(
                    &Self::lock_key(subject),
                    until,
                    lockout + self.config.violation_window_seconds * 2,
                )
                .await?;
            error!(subject, "Address locked out after repeated rate limit violations");
        }
        Ok(())
    }

    /// Notes that a request from the address was throttled.
    pub async fn record_violation(&self, addr: &IpAddr) {
        let subject = address_subject(addr);
        if let Err(e) = self.try_record_violation(&subject).await {
            error!(subject = %subject, error = %e, "Failed to record rate limit violation");
        }
    }

    /// Full per-request step for callers that do not wrap a handler:
    /// decide, then record the request or the violation.
    pub async fn check_and_record(&self, addr: &IpAddr) -> Decision {
        let decision = self.check(addr).await;
        match decision {
            Decision::Allow { count } => {
                self.record(addr).await;
                Decision::Allow { count: count + 1 }
            }
            Decision::Throttle { .. } => {
                self.record_violation(addr).await;
                decision
            }
            Decision::Locked { .. } => decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{InMemoryStorage, MockStorage};
    use mockall::predicate::*;
    use std::net::Ipv4Addr;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));

    fn limiter() -> (RateLimiter, ManualClock) {
        let clock = ManualClock::at(1_699_999_200);
        let storage = Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
        (
            RateLimiter::with_clock(storage, RateLimitConfig::default(), Arc::new(clock.clone())),
            clock,
        )
    }

    async fn fill_window(limiter: &RateLimiter) {
        for _ in 0..100 {
            assert!(limiter.check_and_record(&ADDR).await.is_allowed());
        }
    }

    #[tokio::test]
    async fn test_check_is_idempotent() {
        let (limiter, _) = limiter();
        limiter.record(&ADDR).await;

        assert_eq!(limiter.check(&ADDR).await, Decision::Allow { count: 1 });
        assert_eq!(limiter.check(&ADDR).await, Decision::Allow { count: 1 });
    }

    #[tokio::test]
    async fn test_101st_request_is_throttled() {
        let (limiter, clock) = limiter();
        fill_window(&limiter).await;

        assert_eq!(
            limiter.check_and_record(&ADDR).await,
            Decision::Throttle {
                retry_after_secs: 60
            }
        );

        // other addresses are unaffected
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
        assert!(limiter.check(&other).await.is_allowed());

        clock.advance(Duration::seconds(60));
        assert_eq!(limiter.check(&ADDR).await, Decision::Allow { count: 0 });
    }

    #[tokio::test]
    async fn test_three_throttled_windows_lock_then_recover() {
        let (limiter, clock) = limiter();

        for _ in 0..3 {
            fill_window(&limiter).await;
            // repeated rejections in one window count once
            for _ in 0..5 {
                assert!(matches!(
                    limiter.check_and_record(&ADDR).await,
                    Decision::Throttle { .. }
                ));
            }
            clock.advance(Duration::seconds(60));
        }

        assert_eq!(
            limiter.check_and_record(&ADDR).await,
            Decision::Locked {
                retry_after_secs: 240
            }
        );

        clock.advance(Duration::seconds(240));
        assert_eq!(limiter.check(&ADDR).await, Decision::Allow { count: 0 });

        // history was cleared: one more throttled window does not re-lock
        fill_window(&limiter).await;
        assert!(matches!(
            limiter.check_and_record(&ADDR).await,
            Decision::Throttle { .. }
        ));
        clock.advance(Duration::seconds(60));
        assert!(limiter.check(&ADDR).await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let mut storage = MockStorage::new();
        storage
            .expect_get_marker()
            .returning(|_| Err(AuthError::StorageError("connection refused".into())));
        storage
            .expect_increment_counter()
            .returning(|_, _| Err(AuthError::StorageError("connection refused".into())));

        let limiter = RateLimiter::new(Arc::new(storage), RateLimitConfig::default());
        assert_eq!(
            limiter.check_and_record(&ADDR).await,
            Decision::Allow { count: 1 }
        );
    }

    #[test]
    fn test_path_guard() {
        let guard = PathGuard::from_config(&RateLimitConfig::default());
        assert!(guard.is_guarded("/platformadmin/dashboard"));
        assert!(!guard.is_guarded("/courses/"));
        assert!(!guard.is_guarded("/static/platformadmin/app.css"));

        let guard = PathGuard::new(vec!["/".into()], vec!["/otp/".into(), "/health".into()]);
        assert!(guard.is_guarded("/anything"));
        assert!(!guard.is_guarded("/otp/verify"));
        assert!(!guard.is_guarded("/healthz"));
    }

    #[test]
    fn test_address_subject_hides_address() {
        let subject = address_subject(&ADDR);
        assert_eq!(subject.len(), 16);
        assert!(subject.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!subject.contains("203"));
        assert_eq!(subject, address_subject(&ADDR));
        assert_ne!(
            subject,
            address_subject(&IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)))
        );
    }

    #[tokio::test]
    async fn test_store_keys_use_hashed_address() {
        let subject = address_subject(&ADDR);
        let counter_prefix = format!("admin_requests:{}:", subject);

        let mut storage = MockStorage::new();
        storage
            .expect_get_marker()
            .with(eq(format!("admin_lockout:{}", subject)))
            .times(1)
            .returning(|_| Ok(None));
        storage
            .expect_get_counter()
            .withf(move |key| key.starts_with(&counter_prefix) && !key.contains("203.0.113.7"))
            .times(1)
            .returning(|_| Ok(0));

        let limiter = RateLimiter::new(Arc::new(storage), RateLimitConfig::default());
        assert_eq!(limiter.check(&ADDR).await, Decision::Allow { count: 0 });
    }

    #[test]
    fn test_client_address() {
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        assert_eq!(
            client_address(Some("203.0.113.7, 10.0.0.2"), peer),
            Some(ADDR)
        );
        assert_eq!(client_address(Some("garbage"), peer), peer);
        assert_eq!(client_address(None, peer), peer);
        assert_eq!(client_address(None, None), None);
        assert_eq!(
            client_address(Some(" 2001:db8::1 "), None),
            "2001:db8::1".parse().ok()
        );
    }
}
