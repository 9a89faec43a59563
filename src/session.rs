//! Per-client verification state for signup and password reset.
//!
//! ```text
//! None ──begin──▶ Pending(purpose) ──complete──▶ (verified)
//!                      │                         signup: principal activated, state dropped
//!                      │                         reset:  ResetAuthorized until the password change
//!                      └──cancel / expiry──▶ None
//! ```

use crate::credential::Purpose;
use crate::errors::AuthError;
use crate::principal::{Principal, PrincipalDirectory};
use crate::service::OtpService;
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Shown for every forgot-password submission, known address or not.
pub const RESET_REQUESTED_MESSAGE: &str =
    "If an account with this email exists, you will receive an OTP.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    None,
    Pending {
        principal_id: String,
        purpose: Purpose,
    },
    /// Password reset code verified; one password change is allowed.
    ResetAuthorized { principal_id: String },
}

/// What the caller should do after a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The principal is active and the client may be signed in.
    Authenticated { principal_id: String },
    /// The client may set a new password; it is not signed in.
    PasswordChangeAllowed { principal_id: String },
}

pub struct PendingFlow {
    otp: Arc<OtpService>,
    directory: Arc<dyn PrincipalDirectory>,
    storage: Arc<dyn Storage>,
    session_ttl_seconds: u64,
}

impl PendingFlow {
    pub fn new(
        otp: Arc<OtpService>,
        directory: Arc<dyn PrincipalDirectory>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let session_ttl_seconds = otp.config.session_ttl_seconds;
        Self {
            otp,
            directory,
            storage,
            session_ttl_seconds,
        }
    }

    pub fn otp(&self) -> &OtpService {
        &self.otp
    }

    pub async fn state(&self, session_id: &str) -> Result<SessionState, AuthError> {
        Ok(self
            .storage
            .load_session(session_id)
            .await?
            .unwrap_or_default())
    }

    async fn store(&self, session_id: &str, state: &SessionState) -> Result<(), AuthError> {
        self.storage
            .save_session(session_id, state, self.session_ttl_seconds)
            .await
    }

    /// Starts email verification for a freshly created, inactive principal.
    ///
    /// The pending state is stored even when delivery fails so the client can
    /// ask for a resend; the delivery error is still returned.
    #[instrument(skip(self, principal), fields(principal_id = %principal.id))]
    pub async fn begin_signup(
        &self,
        session_id: &str,
        principal: &Principal,
    ) -> Result<(), AuthError> {
        self.begin(session_id, principal, Purpose::SignupVerification)
            .await
    }

    /// Starts a password reset. Returns the same outcome whether or not the
    /// identifier belongs to a principal; a code is only issued on a match.
    #[instrument(skip(self, identifier))]
    pub async fn begin_password_reset(
        &self,
        session_id: &str,
        identifier: &str,
    ) -> Result<(), AuthError> {
        let Some(principal) = self.directory.find_by_identifier(identifier).await? else {
            info!("Password reset requested for unknown identifier");
            return Ok(());
        };

        match self.begin(session_id, &principal, Purpose::PasswordReset).await {
            Ok(()) => Ok(()),
            // quotas are per principal; reporting them would reveal the account
            Err(AuthError::RateLimited { .. })
            | Err(AuthError::Cooldown { .. })
            | Err(AuthError::DeliveryError(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn begin(
        &self,
        session_id: &str,
        principal: &Principal,
        purpose: Purpose,
    ) -> Result<(), AuthError> {
        let issued = self.otp.issue(principal, purpose).await;
        if let Err(e) = &issued {
            if !e.is_resendable() {
                return issued;
            }
        }

        self.store(
            session_id,
            &SessionState::Pending {
                principal_id: principal.id.clone(),
                purpose,
            },
        )
        .await?;
        issued
    }

    async fn pending(&self, session_id: &str) -> Result<(String, Purpose), AuthError> {
        match self.state(session_id).await? {
            SessionState::Pending {
                principal_id,
                purpose,
            } => Ok((principal_id, purpose)),
            _ => Err(AuthError::NotFound),
        }
    }

    async fn principal(&self, principal_id: &str) -> Result<Principal, AuthError> {
        self.directory
            .find_by_id(principal_id)
            .await?
            .ok_or(AuthError::NotFound)
    }

    pub async fn resend(&self, session_id: &str) -> Result<(), AuthError> {
        let (principal_id, purpose) = self.pending(session_id).await?;
        let principal = self.principal(&principal_id).await?;
        self.otp.resend(&principal, purpose).await
    }

    /// Verifies the submitted code against the pending principal and applies
    /// the purpose-specific completion.
    #[instrument(skip(self, code))]
    pub async fn complete(&self, session_id: &str, code: &str) -> Result<Completion, AuthError> {
        let (principal_id, purpose) = self.pending(session_id).await?;
        self.otp.verify(&principal_id, purpose, code).await?;

        match purpose {
            Purpose::PasswordReset => {
                self.store(
                    session_id,
                    &SessionState::ResetAuthorized {
                        principal_id: principal_id.clone(),
                    },
                )
                .await?;
                info!(principal_id = %principal_id, "Password reset authorized");
                Ok(Completion::PasswordChangeAllowed { principal_id })
            }
            Purpose::SignupVerification | Purpose::Login => {
                let principal = self.principal(&principal_id).await?;
                if !principal.active {
                    self.directory.activate(&principal).await?;
                }
                self.storage.delete_session(session_id).await?;
                info!(principal_id = %principal_id, "Principal verified");
                Ok(Completion::Authenticated { principal_id })
            }
        }
    }

    /// Applies the one password change a verified reset allows.
    #[instrument(skip(self, new_secret))]
    pub async fn change_password(
        &self,
        session_id: &str,
        new_secret: &str,
    ) -> Result<(), AuthError> {
        let SessionState::ResetAuthorized { principal_id } = self.state(session_id).await? else {
            warn!("Password change without a verified reset");
            return Err(AuthError::NotFound);
        };

        let principal = self.principal(&principal_id).await?;
        self.directory.set_credential(&principal, new_secret).await?;
        self.otp
            .invalidate(&principal_id, Purpose::PasswordReset)
            .await?;
        self.storage.delete_session(session_id).await?;
        info!(principal_id = %principal_id, "Password changed");
        Ok(())
    }

    /// Abandons whatever flow the session is in. Issued codes are left to
    /// expire on their own.
    pub async fn cancel(&self, session_id: &str) -> Result<(), AuthError> {
        self.storage.delete_session(session_id).await
    }
}
