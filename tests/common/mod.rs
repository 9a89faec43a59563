use async_trait::async_trait;
use axum::Router;
use otp_guard::{
    axum_api::{auth_router, with_rate_limit},
    AuthConfig, AuthError, EmailNotifier, EmailSender, InMemoryStorage, ManualClock, OtpService,
    PendingFlow, Principal, PrincipalDirectory, RateLimitConfig, RateLimiter, Storage,
    TokenService,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const START: i64 = 1_699_999_200;

#[derive(Clone, Default)]
pub struct TestEmailSender {
    pub sent_emails: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl TestEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Code from the most recent email to `recipient`.
    #[allow(dead_code)]
    pub fn last_code(&self, recipient: &str) -> Option<String> {
        let sent = self.sent_emails.lock().unwrap();
        sent.iter()
            .rev()
            .find(|(to, _, _)| to == recipient)
            .and_then(|(_, _, body)| body.split("is: ").nth(1))
            .and_then(|rest| rest.lines().next())
            .map(str::to_string)
    }
}

#[async_trait]
impl EmailSender for TestEmailSender {
    async fn send_email(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), AuthError> {
        self.sent_emails.lock().unwrap().push((
            recipient.to_string(),
            subject.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct TestDirectory {
    pub principals: Mutex<HashMap<String, Principal>>,
    pub passwords: Mutex<HashMap<String, String>>,
}

#[allow(dead_code)]
impl TestDirectory {
    pub fn insert(&self, principal: Principal) {
        self.principals
            .lock()
            .unwrap()
            .insert(principal.id.clone(), principal);
    }

    pub fn get(&self, id: &str) -> Option<Principal> {
        self.principals.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl PrincipalDirectory for TestDirectory {
    async fn find_by_identifier(&self, identifier: &str) -> Result<Option<Principal>, AuthError> {
        Ok(self
            .principals
            .lock()
            .unwrap()
            .values()
            .find(|p| p.identifier == identifier)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Principal>, AuthError> {
        Ok(self.get(id))
    }

    async fn activate(&self, principal: &Principal) -> Result<(), AuthError> {
        if let Some(p) = self.principals.lock().unwrap().get_mut(&principal.id) {
            p.active = true;
        }
        Ok(())
    }

    async fn set_credential(
        &self,
        principal: &Principal,
        new_secret: &str,
    ) -> Result<(), AuthError> {
        self.passwords
            .lock()
            .unwrap()
            .insert(principal.id.clone(), new_secret.to_string());
        Ok(())
    }
}

#[allow(dead_code)]
pub struct TestApp {
    pub router: Router,
    pub flow: Arc<PendingFlow>,
    pub tokens: Arc<TokenService>,
    pub emails: Arc<TestEmailSender>,
    pub directory: Arc<TestDirectory>,
    pub clock: ManualClock,
}

#[allow(dead_code)]
pub fn spawn_app() -> TestApp {
    spawn_app_with(RateLimitConfig::default())
}

/// Builds the HTTP surface over in-memory storage and a manual clock, with
/// the limiter applied to `limits.guarded_prefixes`.
pub fn spawn_app_with(limits: RateLimitConfig) -> TestApp {
    let config = AuthConfig {
        jwt_secret: "integration-test-secret".into(),
        ..AuthConfig::default()
    };

    let clock = ManualClock::at(START);
    let storage: Arc<dyn Storage> =
        Arc::new(InMemoryStorage::with_clock(Arc::new(clock.clone())));
    let emails = Arc::new(TestEmailSender::new());
    let notifier = Arc::new(EmailNotifier::new(emails.clone(), &config));

    let otp = Arc::new(OtpService::with_clock(
        config.clone(),
        storage.clone(),
        notifier,
        Arc::new(clock.clone()),
    ));
    let directory = Arc::new(TestDirectory::default());
    let flow = Arc::new(PendingFlow::new(otp, directory.clone(), storage.clone()));
    let tokens = Arc::new(TokenService::new(config));
    let limiter = Arc::new(RateLimiter::with_clock(
        storage,
        limits,
        Arc::new(clock.clone()),
    ));

    let router = with_rate_limit(auth_router(flow.clone(), tokens.clone()), limiter);

    TestApp {
        router,
        flow,
        tokens,
        emails,
        directory,
        clock,
    }
}
