//! SMTP mailer (lettre, async tokio transport).

use crate::{EmailMessage, NotifyError, Result};
use fileflow_protocol::SmtpConfig;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

/// Sends stakeholder email through a configured SMTP relay.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| NotifyError::Smtp(e.to_string()))?
                .port(config.port);
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        let from = parse_mailbox(&config.from_email)?;
        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    pub async fn send(&self, message: &EmailMessage) -> Result<()> {
        if message.recipients.is_empty() {
            return Ok(());
        }

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone());
        for recipient in &message.recipients {
            builder = builder.to(parse_mailbox(recipient)?);
        }
        for cc in &message.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        let email = if message.attachments.is_empty() {
            builder
                .body(message.body.clone())
                .map_err(|e| NotifyError::Smtp(e.to_string()))?
        } else {
            let mut parts = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
            for attachment in &message.attachments {
                let content_type = attachment
                    .content_type
                    .parse::<ContentType>()
                    .map_err(|_| NotifyError::Smtp(format!(
                        "invalid attachment content type '{}'",
                        attachment.content_type
                    )))?;
                parts = parts.singlepart(
                    Attachment::new(attachment.filename.clone())
                        .body(attachment.content.clone(), content_type),
                );
            }
            builder
                .multipart(parts)
                .map_err(|e| NotifyError::Smtp(e.to_string()))?
        };

        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;
        info!(
            subject = %message.subject,
            recipients = message.recipients.len(),
            "sent stakeholder email"
        );
        Ok(())
    }
}

fn parse_mailbox(raw: &str) -> Result<Mailbox> {
    raw.parse()
        .map_err(|_| NotifyError::Address(raw.to_string()))
}
