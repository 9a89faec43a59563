use crate::errors::AuthError;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub otp_length: usize,
    pub otp_validity_seconds: u64,
    pub otp_max_verify_attempts: u32,
    pub otp_attempt_window_seconds: u64,
    pub otp_lockout_seconds: u64,
    pub otp_resend_cooldown_seconds: u64,
    pub otp_max_resend_per_hour: u32,
    pub session_ttl_seconds: u64,
    pub session_cookie_name: String,
    pub jwt_secret: String,
    pub jwt_algorithm: jsonwebtoken::Algorithm,
    pub session_token_expire_minutes: i64,
    pub auth_cookie_name: String,
    pub auth_cookie_domain: Option<String>,
    pub auth_cookie_path: String,
    pub auth_cookie_secure: bool,
    pub auth_cookie_same_site: String,
    pub redis_url: String,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub smtp_starttls: bool,
    pub smtp_username: String,
    pub smtp_password: String,
    pub mail_from: String,
    pub mail_from_name: String,
    pub site_name: String,
    pub storage_type: StorageType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StorageType {
    Memory,
    Redis,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            otp_length: 6,
            otp_validity_seconds: 300,
            otp_max_verify_attempts: 5,
            otp_attempt_window_seconds: 1800,
            otp_lockout_seconds: 900,
            otp_resend_cooldown_seconds: 60,
            otp_max_resend_per_hour: 5,
            session_ttl_seconds: 3600,
            session_cookie_name: "otp_session".to_string(),
            jwt_secret: "secret".to_string(),
            jwt_algorithm: jsonwebtoken::Algorithm::HS256,
            session_token_expire_minutes: 60,
            auth_cookie_name: "auth_token".to_string(),
            auth_cookie_domain: None,
            auth_cookie_path: "/".to_string(),
            auth_cookie_secure: true,
            auth_cookie_same_site: "Lax".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            smtp_server: "localhost".to_string(),
            smtp_port: 1025,
            smtp_starttls: true,
            smtp_username: "".to_string(),
            smtp_password: "".to_string(),
            mail_from: "noreply@example.com".to_string(),
            mail_from_name: "Auth Service".to_string(),
            site_name: "LeQ".to_string(),
            storage_type: StorageType::Memory,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, target: &mut T) -> Result<(), AuthError> {
    if let Ok(val) = std::env::var(name) {
        *target = val
            .parse()
            .map_err(|_| AuthError::ConfigError(format!("Invalid {}", name)))?;
    }
    Ok(())
}

impl AuthConfig {
    pub fn from_env() -> Result<Self, AuthError> {
        let mut config = Self::default();

        parse_env("OTP_LENGTH", &mut config.otp_length)?;
        parse_env("OTP_VALIDITY_SECONDS", &mut config.otp_validity_seconds)?;
        parse_env("OTP_MAX_VERIFY_ATTEMPTS", &mut config.otp_max_verify_attempts)?;
        parse_env(
            "OTP_ATTEMPT_WINDOW_SECONDS",
            &mut config.otp_attempt_window_seconds,
        )?;
        parse_env("OTP_LOCKOUT_SECONDS", &mut config.otp_lockout_seconds)?;
        parse_env(
            "OTP_RESEND_COOLDOWN_SECONDS",
            &mut config.otp_resend_cooldown_seconds,
        )?;
        parse_env("OTP_MAX_RESEND_PER_HOUR", &mut config.otp_max_resend_per_hour)?;
        parse_env("SESSION_TTL_SECONDS", &mut config.session_ttl_seconds)?;

        if config.otp_max_verify_attempts == 0 {
            return Err(AuthError::ConfigError(
                "OTP_MAX_VERIFY_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if let Ok(val) = std::env::var("SESSION_COOKIE_NAME") {
            config.session_cookie_name = val;
        }

        // Required in production, falls back to the development default
        if let Ok(val) = std::env::var("JWT_SECRET") {
            config.jwt_secret = val;
        }
        parse_env(
            "SESSION_TOKEN_EXPIRE_MINUTES",
            &mut config.session_token_expire_minutes,
        )?;

        if let Ok(val) = std::env::var("STORAGE_TYPE") {
            config.storage_type = match val.to_lowercase().as_str() {
                "memory" => StorageType::Memory,
                "redis" => StorageType::Redis,
                _ => {
                    return Err(AuthError::ConfigError(
                        "Invalid STORAGE_TYPE: must be 'memory' or 'redis'".to_string(),
                    ))
                }
            };
        }

        if config.storage_type == StorageType::Redis {
            let redis_host = std::env::var("REDIS_HOST")
                .map_err(|_| AuthError::ConfigError("REDIS_HOST must be set".to_string()))?;
            let redis_port = std::env::var("REDIS_PORT")
                .map_err(|_| AuthError::ConfigError("REDIS_PORT must be set".to_string()))?;
            config.redis_url = format!("redis://{}:{}/", redis_host, redis_port);
        }

        if let Ok(val) = std::env::var("SMTP_HOST") {
            config.smtp_server = val;
        }
        parse_env("SMTP_PORT", &mut config.smtp_port)?;
        if let Ok(val) = std::env::var("SMTP_STARTTLS") {
            config.smtp_starttls = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("SMTP_USERNAME") {
            config.smtp_username = val;
        }
        if let Ok(val) = std::env::var("SMTP_PASSWORD") {
            config.smtp_password = val;
        }
        if let Ok(val) = std::env::var("SMTP_MAIL_FROM") {
            config.mail_from = val;
        }
        if let Ok(val) = std::env::var("SMTP_MAIL_FROM_NAME") {
            config.mail_from_name = val;
        }
        if let Ok(val) = std::env::var("SITE_NAME") {
            config.site_name = val;
        }

        if let Ok(val) = std::env::var("AUTH_COOKIE_NAME") {
            config.auth_cookie_name = val;
        }
        if let Ok(val) = std::env::var("AUTH_COOKIE_DOMAIN") {
            config.auth_cookie_domain = Some(val);
        }
        if let Ok(val) = std::env::var("AUTH_COOKIE_PATH") {
            config.auth_cookie_path = val;
        }
        if let Ok(val) = std::env::var("AUTH_COOKIE_SECURE") {
            config.auth_cookie_secure = val.parse().unwrap_or(true);
        }
        if let Ok(val) = std::env::var("AUTH_COOKIE_SAMESITE") {
            config.auth_cookie_same_site = val;
        }

        Ok(config)
    }
}

/// Settings for the admin request limiter.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
    pub max_violations: u32,
    pub violation_window_seconds: u64,
    pub lockout_seconds: u64,
    pub guarded_prefixes: Vec<String>,
    pub exempt_prefixes: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_seconds: 60,
            max_violations: 3,
            violation_window_seconds: 3600,
            lockout_seconds: 300,
            guarded_prefixes: vec!["/platformadmin/".to_string()],
            exempt_prefixes: vec![
                "/static/".to_string(),
                "/media/".to_string(),
                "/health".to_string(),
                "/otp/".to_string(),
            ],
        }
    }
}

fn parse_prefixes(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

impl RateLimitConfig {
    pub fn from_env() -> Result<Self, AuthError> {
        let mut config = Self::default();

        parse_env("ADMIN_RATE_LIMIT", &mut config.max_requests)?;
        parse_env("ADMIN_RATE_WINDOW", &mut config.window_seconds)?;
        parse_env("ADMIN_MAX_VIOLATIONS", &mut config.max_violations)?;
        parse_env(
            "ADMIN_VIOLATION_WINDOW",
            &mut config.violation_window_seconds,
        )?;
        parse_env("ADMIN_LOCKOUT_DURATION", &mut config.lockout_seconds)?;

        if config.window_seconds == 0 || config.violation_window_seconds == 0 {
            return Err(AuthError::ConfigError(
                "Rate limit windows must be non-zero".to_string(),
            ));
        }

        if let Ok(val) = std::env::var("ADMIN_GUARDED_PATHS") {
            config.guarded_prefixes = parse_prefixes(&val);
        }
        if let Ok(val) = std::env::var("ADMIN_EXEMPT_PATHS") {
            config.exempt_prefixes = parse_prefixes(&val);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = AuthConfig::default();
        assert_eq!(config.otp_length, 6);
        assert_eq!(config.otp_validity_seconds, 300);
        assert_eq!(config.otp_max_verify_attempts, 5);
        assert_eq!(config.otp_lockout_seconds, 900);

        let limits = RateLimitConfig::default();
        assert_eq!(limits.max_requests, 100);
        assert_eq!(limits.window_seconds, 60);
        assert_eq!(limits.max_violations, 3);
        assert_eq!(limits.lockout_seconds, 300);
    }

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(
            parse_prefixes("/admin/, /ops/ ,,"),
            vec!["/admin/".to_string(), "/ops/".to_string()]
        );
    }
}
