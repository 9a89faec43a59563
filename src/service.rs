use crate::clock::{Clock, SystemClock};
use crate::config::AuthConfig;
use crate::credential::{generate_token, Credential, Purpose};
use crate::email::Notifier;
use crate::errors::AuthError;
use crate::principal::Principal;
use crate::storage::Storage;
use crate::window::{SlidingLog, WindowCounter};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument, warn};

fn pair_key(principal_id: &str, purpose: Purpose) -> String {
    format!("{}:{}", principal_id, purpose)
}

fn secs_between(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    u64::try_from((until - now).num_seconds()).unwrap_or(0).max(1)
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Issues and verifies one-time passcodes.
///
/// Resends and failed verifications are tracked by separate counters: the
/// resend quota guards the delivery channel, the attempt quota guards the
/// code space.
pub struct OtpService {
    pub config: AuthConfig,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    resends: SlidingLog,
    attempts: WindowCounter,
}

impl OtpService {
    pub fn new(config: AuthConfig, storage: Arc<dyn Storage>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_clock(config, storage, notifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AuthConfig,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let resends = SlidingLog::new(storage.clone(), clock.clone(), "otp_resend", 3600);
        let attempts = WindowCounter::new(
            storage.clone(),
            clock.clone(),
            "otp_attempts",
            config.otp_attempt_window_seconds,
        );
        Self {
            config,
            storage,
            notifier,
            clock,
            resends,
            attempts,
        }
    }

    fn cooldown_key(key: &str) -> String {
        format!("otp_cooldown:{}", key)
    }

    fn lock_key(key: &str) -> String {
        format!("otp_lock:{}", key)
    }

    /// Generates, stores and delivers a fresh code for the pair.
    ///
    /// A delivery failure is reported as [`AuthError::DeliveryError`] but the
    /// credential stays stored and no cooldown is applied, so a resend can
    /// retry right away.
    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn issue(&self, principal: &Principal, purpose: Purpose) -> Result<(), AuthError> {
        let key = pair_key(&principal.id, purpose);
        let now = self.clock.now();

        if let Some(retry_after_secs) = self
            .resends
            .retry_after(&key, self.config.otp_max_resend_per_hour)
            .await?
        {
            warn!("OTP resend quota exhausted");
            return Err(AuthError::RateLimited { retry_after_secs });
        }

        let cooldown_key = Self::cooldown_key(&key);
        let cooldown = self.config.otp_resend_cooldown_seconds;
        let cooldown_until = now + seconds(cooldown);
        if cooldown > 0
            && !self
                .storage
                .set_marker_if_absent(&cooldown_key, cooldown_until, cooldown)
                .await?
        {
            let retry_after_secs = match self.storage.get_marker(&cooldown_key).await? {
                Some(until) => secs_between(now, until),
                None => cooldown,
            };
            return Err(AuthError::Cooldown { retry_after_secs });
        }

        self.storage.delete_credential(&principal.id, purpose).await?;

        let validity = self.config.otp_validity_seconds;
        let credential = Credential::new(
            &principal.id,
            purpose,
            generate_token(self.config.otp_length),
            now,
            seconds(validity),
        );
        // kept past valid_until so a late submission reports Expired
        self.storage
            .put_credential(&credential, validity.saturating_mul(2))
            .await?;

        let delivery = self
            .notifier
            .deliver(principal, &credential.token, purpose)
            .await;

        self.resends.record(&key).await?;
        self.attempts.clear(&key).await?;

        match delivery {
            Ok(()) => {
                info!(%purpose, "OTP issued");
                Ok(())
            }
            Err(e) => {
                warn!(%purpose, error = %e, "OTP stored but delivery failed");
                self.storage.delete_marker(&cooldown_key).await?;
                Err(match e {
                    AuthError::DeliveryError(_) => e,
                    other => AuthError::DeliveryError(other.to_string()),
                })
            }
        }
    }

    /// Same as [`OtpService::issue`]; named for the user-facing action.
    pub async fn resend(&self, principal: &Principal, purpose: Purpose) -> Result<(), AuthError> {
        self.issue(principal, purpose).await
    }

    /// Checks a submitted code. On success the credential is consumed and
    /// returned with `confirmed` set.
    #[instrument(skip(self, submitted_code))]
    pub async fn verify(
        &self,
        principal_id: &str,
        purpose: Purpose,
        submitted_code: &str,
    ) -> Result<Credential, AuthError> {
        let key = pair_key(principal_id, purpose);
        let lock_key = Self::lock_key(&key);
        let now = self.clock.now();

        if let Some(until) = self.storage.get_marker(&lock_key).await? {
            if now < until {
                return Err(AuthError::Locked {
                    retry_after_secs: secs_between(now, until),
                });
            }
            self.storage.delete_marker(&lock_key).await?;
            self.attempts.clear(&key).await?;
        }

        let mut credential = match self.storage.get_credential(principal_id, purpose).await? {
            Some(credential) if !credential.confirmed => credential,
            _ => return Err(AuthError::NotFound),
        };

        if credential.is_expired(now) {
            self.storage.delete_credential(principal_id, purpose).await?;
            return Err(AuthError::Expired);
        }

        // the attempt is reserved before the comparison, so concurrent
        // submissions each take their own slot of the budget
        let max_attempts = self.config.otp_max_verify_attempts;
        let attempts = self.attempts.increment(&key).await?;
        if attempts >= max_attempts {
            let lockout = self.config.otp_lockout_seconds;
            self.storage
                .set_marker(
                    &lock_key,
                    now + seconds(lockout),
                    lockout + self.config.otp_attempt_window_seconds,
                )
                .await?;
            warn!(%purpose, "OTP verification locked after repeated failures");
            return Err(AuthError::Locked {
                retry_after_secs: lockout,
            });
        }

        if !credential.matches(submitted_code) {
            let remaining = max_attempts.saturating_sub(attempts).saturating_sub(1);
            info!(%purpose, remaining, "OTP mismatch");
            return Err(AuthError::Mismatch { remaining });
        }

        if !self
            .storage
            .consume_credential(principal_id, purpose, &credential.token)
            .await?
        {
            // a concurrent submission consumed or replaced it first
            return Err(AuthError::NotFound);
        }
        credential.confirmed = true;
        self.attempts.clear(&key).await?;
        info!(%purpose, "OTP verified");

        Ok(credential)
    }

    /// Drops any outstanding credential for the pair.
    pub async fn invalidate(&self, principal_id: &str, purpose: Purpose) -> Result<(), AuthError> {
        self.storage.delete_credential(principal_id, purpose).await
    }
}
