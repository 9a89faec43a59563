use crate::errors::AuthError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The subject being verified. Owned by the host's account store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    /// Delivery address, usually an email.
    pub identifier: String,
    pub active: bool,
}

impl Principal {
    pub fn new(id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identifier: identifier.into(),
            active: false,
        }
    }
}

/// Account lookups and mutations the verification flows need from the host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Principal>, AuthError>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Principal>, AuthError>;
    async fn activate(&self, principal: &Principal) -> Result<(), AuthError>;
    async fn set_credential(&self, principal: &Principal, new_secret: &str)
        -> Result<(), AuthError>;
}
