use crate::config::AuthConfig;
use crate::errors::AuthError;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub jti: String,
    pub typ: String,
}

const SESSION_TOKEN_TYPE: &str = "session";

/// Signs the session token handed out once a principal has verified.
pub struct TokenService {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    pub fn create_session_token(&self, principal_id: &str) -> Result<String, AuthError> {
        let expiration = Utc::now()
            .checked_add_signed(Duration::minutes(self.config.session_token_expire_minutes))
            .ok_or_else(|| AuthError::ConfigError("Session token lifetime overflows".into()))?
            .timestamp();

        let claims = Claims {
            sub: principal_id.to_string(),
            exp: usize::try_from(expiration).unwrap_or(0),
            jti: Uuid::new_v4().to_string(),
            typ: SESSION_TOKEN_TYPE.to_string(),
        };

        let header = Header::new(self.config.jwt_algorithm);
        Ok(encode(&header, &claims, &self.encoding_key)?)
    }

    pub fn verify_session_token(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(self.config.jwt_algorithm);
        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)?;

        if token_data.claims.typ != SESSION_TOKEN_TYPE {
            return Err(AuthError::TokenError(jsonwebtoken::errors::Error::from(
                jsonwebtoken::errors::ErrorKind::InvalidToken,
            )));
        }

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_token_roundtrip_and_tamper() {
        let service = TokenService::new(AuthConfig::default());
        let token = service.create_session_token("42").unwrap();

        let claims = service.verify_session_token(&token).unwrap();
        assert_eq!(claims.sub, "42");

        let other = TokenService::new(AuthConfig {
            jwt_secret: "another-secret".into(),
            ..AuthConfig::default()
        });
        assert!(matches!(
            other.verify_session_token(&token),
            Err(AuthError::TokenError(_))
        ));
    }
}
