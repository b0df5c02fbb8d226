//! Mail relay: one synchronous send per queued email.
//!
//! The SMTP relay is built on lettre's async transport. Port 465 uses
//! implicit TLS, any other port STARTTLS, and `SMTP_USE_TLS=false` talks
//! plain SMTP. Connect and command timeouts are fixed.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MessageBuilder, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use postbox_common::config::SmtpConfig;
use postbox_common::error::AppError;
use postbox_common::types::QueuedEmail;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const IMPLICIT_TLS_PORT: u16 = 465;

#[async_trait]
pub trait MailRelay: Send + Sync {
    async fn send(&self, email: &QueuedEmail) -> Result<(), AppError>;
}

pub struct SmtpRelay {
    /// `None` when no host is configured; every send then fails.
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    default_from: Option<Mailbox>,
}

impl SmtpRelay {
    pub fn from_config(config: &SmtpConfig) -> Result<Self, AppError> {
        let default_from = config.from.as_deref().map(parse_mailbox).transpose()?;

        let Some(host) = config.host.as_deref() else {
            tracing::warn!("SMTP_HOST not set, every send will fail");
            return Ok(Self {
                transport: None,
                default_from,
            });
        };

        let builder = if !config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        } else if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| AppError::Config(format!("invalid SMTP host {}: {}", host, e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| AppError::Config(format!("invalid SMTP host {}: {}", host, e)))?
        };

        let mut builder = builder.port(config.port).timeout(Some(SEND_TIMEOUT));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        tracing::info!(
            host,
            port = config.port,
            tls = config.use_tls,
            "SMTP relay configured"
        );

        Ok(Self {
            transport: Some(builder.build()),
            default_from,
        })
    }
}

#[async_trait]
impl MailRelay for SmtpRelay {
    async fn send(&self, email: &QueuedEmail) -> Result<(), AppError> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| AppError::Config("SMTP host is not configured".to_string()))?;

        let message = build_message(email, self.default_from.as_ref())?;
        transport
            .send(message)
            .await
            .map_err(|e| AppError::Mail(e.to_string()))?;

        Ok(())
    }
}

/// Build the MIME message. Both bodies present gives `multipart/alternative`.
fn build_message(
    email: &QueuedEmail,
    default_from: Option<&Mailbox>,
) -> Result<Message, AppError> {
    let from = match email.from.as_deref() {
        Some(from) => parse_mailbox(from)?,
        None => default_from
            .cloned()
            .ok_or_else(|| AppError::Config("no sender address configured".to_string()))?,
    };

    let mut builder = Message::builder().from(from).subject(email.subject.clone());
    builder = add_recipients(builder, &email.to, MessageBuilder::to)?;
    builder = add_recipients(builder, &email.cc, MessageBuilder::cc)?;
    builder = add_recipients(builder, &email.bcc, MessageBuilder::bcc)?;

    let text = non_blank(&email.body);
    let html = non_blank(&email.html_body);

    let built = match (text, html) {
        (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
            text.to_string(),
            html.to_string(),
        )),
        (None, Some(html)) => builder.header(ContentType::TEXT_HTML).body(html.to_string()),
        (text, None) => builder
            .header(ContentType::TEXT_PLAIN)
            .body(text.unwrap_or_default().to_string()),
    };

    built.map_err(|e| AppError::Mail(format!("failed to build message: {}", e)))
}

fn add_recipients(
    mut builder: MessageBuilder,
    addresses: &[String],
    add: fn(MessageBuilder, Mailbox) -> MessageBuilder,
) -> Result<MessageBuilder, AppError> {
    for address in addresses {
        builder = add(builder, parse_mailbox(address)?);
    }
    Ok(builder)
}

fn parse_mailbox(address: &str) -> Result<Mailbox, AppError> {
    address
        .trim()
        .parse()
        .map_err(|e| AppError::Mail(format!("invalid address '{}': {}", address, e)))
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}
