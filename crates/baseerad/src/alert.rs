//! Outbound email: unknown-visitor alerts and absentee reminders.
//!
//! Sending is always fire-and-forget from the caller's point of view. Failures
//! are logged by [`dispatch`] and never reach the recognition loop.

use crate::settings::AlertTemplates;
use crate::store::Employee;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Implicit-TLS submission port; anything else uses STARTTLS.
const SMTPS_PORT: u16 = 465;
const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_FROM_ADDRESS: &str = "kiosk@baseera.local";

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("email build error: {0}")]
    Build(String),
    #[error("attachment unreadable: {0}")]
    Attachment(#[from] std::io::Error),
    #[error("email delivery is not configured")]
    NotConfigured,
}

/// One outbound message. Owned so it can move into a background task.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// JPEG attached to the message when present.
    pub image: Option<PathBuf>,
}

pub type AlertFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AlertError>> + Send + 'a>>;

/// Delivers alerts somewhere.
pub trait AlertChannel: Send + Sync {
    fn send<'a>(&'a self, alert: &'a Alert) -> AlertFuture<'a>;
}

/// SMTP connection settings, from `BASEERA_SMTP_*`.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_address: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    /// Returns `None` when `BASEERA_SMTP_HOST` is unset, i.e. email is disabled.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("BASEERA_SMTP_HOST").ok().filter(|h| !h.is_empty())?;
        Some(Self {
            host,
            port: std::env::var("BASEERA_SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: std::env::var("BASEERA_SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            user: std::env::var("BASEERA_SMTP_USER").ok(),
            password: std::env::var("BASEERA_SMTP_PASSWORD").ok(),
        })
    }
}

pub struct SmtpAlertChannel {
    config: SmtpConfig,
}

impl SmtpAlertChannel {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let attachment = match &alert.image {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "visitor.jpg".to_string());
                Some((filename, bytes))
            }
            None => None,
        };
        let email = build_message(&self.config.from_address, alert, attachment)?;

        let builder = if self.config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)?
        };
        let mut transport = builder.port(self.config.port);

        if let (Some(user), Some(pass)) = (&self.config.user, &self.config.password) {
            transport = transport.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        transport.build().send(email).await?;
        tracing::info!(to = %alert.recipient, subject = %alert.subject, "email sent");
        Ok(())
    }
}

impl AlertChannel for SmtpAlertChannel {
    fn send<'a>(&'a self, alert: &'a Alert) -> AlertFuture<'a> {
        Box::pin(self.deliver(alert))
    }
}

/// Used when no SMTP host is configured.
pub struct DisabledAlerts;

impl AlertChannel for DisabledAlerts {
    fn send<'a>(&'a self, _alert: &'a Alert) -> AlertFuture<'a> {
        Box::pin(async { Err(AlertError::NotConfigured) })
    }
}

fn build_message(
    from: &str,
    alert: &Alert,
    attachment: Option<(String, Vec<u8>)>,
) -> Result<Message, AlertError> {
    let builder = Message::builder()
        .from(from.parse()?)
        .to(alert.recipient.parse()?)
        .subject(alert.subject.clone());

    let message = match attachment {
        Some((filename, bytes)) => {
            let jpeg = ContentType::parse("image/jpeg").map_err(|e| AlertError::Build(e.to_string()))?;
            builder.multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(alert.body.clone()))
                    .singlepart(Attachment::new(filename).body(bytes, jpeg)),
            )
        }
        None => builder.header(ContentType::TEXT_PLAIN).body(alert.body.clone()),
    };
    message.map_err(|e| AlertError::Build(e.to_string()))
}

/// Send on a background task; the result is only logged.
pub fn dispatch(runtime: &tokio::runtime::Handle, channel: Arc<dyn AlertChannel>, alert: Alert) {
    runtime.spawn(async move {
        if let Err(e) = channel.send(&alert).await {
            tracing::warn!(to = %alert.recipient, error = %e, "email not delivered");
        }
    });
}

/// One reminder per absentee that has an email address.
pub fn absentee_alerts(absentees: &[Employee], templates: &AlertTemplates) -> Vec<Alert> {
    absentees
        .iter()
        .filter(|e| !e.email.trim().is_empty())
        .map(|e| Alert {
            recipient: e.email.trim().to_string(),
            subject: templates.absentee_subject.clone(),
            body: templates.absentee_body_for(&e.name),
            image: None,
        })
        .collect()
}
