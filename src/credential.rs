//! The OTP credential record and token generation.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;

pub const TOKEN_ALPHABET: &[u8] = b"0123456789";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    SignupVerification,
    Login,
    PasswordReset,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::SignupVerification => "signup_verification",
            Purpose::Login => "login",
            Purpose::PasswordReset => "password_reset",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub principal_id: String,
    pub purpose: Purpose,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub confirmed: bool,
}

impl Credential {
    pub fn new(
        principal_id: &str,
        purpose: Purpose,
        token: String,
        issued_at: DateTime<Utc>,
        validity: Duration,
    ) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            purpose,
            token,
            issued_at,
            valid_until: issued_at + validity,
            confirmed: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    /// Compares in constant time with respect to the token contents.
    pub fn matches(&self, submitted: &str) -> bool {
        self.token
            .as_bytes()
            .ct_eq(submitted.trim().as_bytes())
            .into()
    }
}

/// Numeric token drawn uniformly from the digit alphabet using the OS RNG.
pub fn generate_token(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}
