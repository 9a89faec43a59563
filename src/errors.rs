use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Delivery error: {0}")]
    DeliveryError(String),

    #[error("Token error: {0}")]
    TokenError(#[from] jsonwebtoken::errors::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Too many OTP requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("OTP requested too recently, retry in {retry_after_secs}s")]
    Cooldown { retry_after_secs: u64 },

    #[error("No active OTP found")]
    NotFound,

    #[error("OTP expired")]
    Expired,

    #[error("Invalid OTP, {remaining} attempts remaining")]
    Mismatch { remaining: u32 },

    #[error("Too many failed attempts, retry in {retry_after_secs}s")]
    Locked { retry_after_secs: u64 },

    #[error("Access temporarily blocked")]
    Forbidden,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}

impl AuthError {
    /// Soft failures leave the issued credential in place; the caller may resend.
    pub fn is_resendable(&self) -> bool {
        matches!(self, AuthError::DeliveryError(_))
    }
}
