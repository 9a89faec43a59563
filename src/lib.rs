#![doc = include_str!("../README.md")]

#[cfg(feature = "axum")]
pub use tower_cookies;

#[cfg(feature = "axum")]
pub mod axum_api;
pub mod clock;
pub mod config;
pub mod credential;
pub mod cron;
pub mod email;
pub mod errors;
pub mod principal;
pub mod rate_limit;
pub mod service;
pub mod session;
pub mod storage;
pub mod token;
pub mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, RateLimitConfig, StorageType};
pub use credential::{Credential, Purpose};
pub use cron::CleanupService;
pub use email::{EmailNotifier, EmailSender, LettreEmailSender, Notifier};
pub use errors::AuthError;
pub use principal::{Principal, PrincipalDirectory};
pub use rate_limit::{address_subject, client_address, Decision, PathGuard, RateLimiter};
pub use service::OtpService;
pub use session::{Completion, PendingFlow, SessionState};
pub use storage::{InMemoryStorage, RedisStorage, Storage};
pub use token::TokenService;
pub use window::{SlidingLog, WindowCounter};
