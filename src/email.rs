use crate::config::AuthConfig;
use crate::credential::Purpose;
use crate::errors::AuthError;
use crate::principal::Principal;
use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;

/// Out-of-band delivery of a freshly issued code.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        principal: &Principal,
        code: &str,
        purpose: Purpose,
    ) -> Result<(), AuthError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, recipient: &str, subject: &str, body: &str)
        -> Result<(), AuthError>;
}

pub struct LettreEmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
}

impl LettreEmailSender {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let creds = Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());

        // Local catchers such as Mailpit listen unencrypted on 1025
        let mailer = if config.smtp_port == 1025 {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_server)
                .port(config.smtp_port)
                .build()
        } else if config.smtp_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
                .map_err(|e| AuthError::ConfigError(format!("Invalid SMTP host: {}", e)))?
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_server)
                .map_err(|e| AuthError::ConfigError(format!("Invalid SMTP host: {}", e)))?
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        };

        Ok(Self {
            mailer,
            from_email: config.mail_from.clone(),
            from_name: config.mail_from_name.clone(),
        })
    }
}

#[async_trait]
impl EmailSender for LettreEmailSender {
    async fn send_email(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), AuthError> {
        let email = Message::builder()
            .from(
                format!("{} <{}>", self.from_name, self.from_email)
                    .parse()
                    .map_err(|e| {
                        AuthError::DeliveryError(format!("Invalid from address: {}", e))
                    })?,
            )
            .to(recipient
                .parse()
                .map_err(|e| AuthError::DeliveryError(format!("Invalid to address: {}", e)))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| AuthError::DeliveryError(format!("Failed to build email: {}", e)))?;

        self.mailer
            .send(email)
            .await
            .map_err(|e| AuthError::DeliveryError(format!("Failed to send email: {}", e)))?;
        Ok(())
    }
}

/// Sends codes by email with a subject per purpose.
pub struct EmailNotifier {
    sender: Arc<dyn EmailSender>,
    site_name: String,
    validity_minutes: u64,
}

impl EmailNotifier {
    pub fn new(sender: Arc<dyn EmailSender>, config: &AuthConfig) -> Self {
        Self {
            sender,
            site_name: config.site_name.clone(),
            validity_minutes: config.otp_validity_seconds / 60,
        }
    }

    pub fn subject(&self, purpose: Purpose) -> String {
        match purpose {
            Purpose::SignupVerification => format!("Verify Your Email - {}", self.site_name),
            Purpose::Login => format!("Login Verification Code - {}", self.site_name),
            Purpose::PasswordReset => format!("Password Reset Code - {}", self.site_name),
        }
    }

    fn body(&self, code: &str) -> String {
        format!(
            "Your verification code is: {}\n\nThis code is valid for {} minutes. \
             If you did not request it, you can ignore this email.",
            code, self.validity_minutes
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn deliver(
        &self,
        principal: &Principal,
        code: &str,
        purpose: Purpose,
    ) -> Result<(), AuthError> {
        self.sender
            .send_email(&principal.identifier, &self.subject(purpose), &self.body(code))
            .await
            .map_err(|e| match e {
                AuthError::DeliveryError(_) => e,
                other => AuthError::DeliveryError(other.to_string()),
            })
    }
}
