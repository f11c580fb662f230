//! Notification senders.
//!
//! Stakeholders hear about file-level failures by email; the data team
//! hears about internal faults by webhook. Both sit behind the
//! [`Notifier`] trait so the pipeline never knows which transports are
//! configured. Sends are best-effort: a failed notification is logged,
//! never allowed to change a pipeline outcome.

pub mod smtp;
pub mod webhook;

pub use smtp::SmtpMailer;
pub use webhook::WebhookClient;

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Notification failures.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("smtp error: {0}")]
    Smtp(String),
    #[error("webhook error: {0}")]
    Webhook(String),
    #[error("invalid address '{0}'")]
    Address(String),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

/// A file attached to a stakeholder email (e.g. a DLQ extract).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A stakeholder email.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmailMessage {
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<EmailAttachment>,
}

/// Email + webhook capability seam.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn email(&self, message: &EmailMessage) -> Result<()>;
    async fn webhook(&self, payload: &serde_json::Value) -> Result<()>;
}

/// Production notifier: optional SMTP, optional webhook. Unconfigured
/// transports log and drop.
pub struct Notifications {
    mailer: Option<SmtpMailer>,
    webhook: Option<WebhookClient>,
}

impl Notifications {
    pub fn new(mailer: Option<SmtpMailer>, webhook: Option<WebhookClient>) -> Self {
        Self { mailer, webhook }
    }
}

#[async_trait]
impl Notifier for Notifications {
    async fn email(&self, message: &EmailMessage) -> Result<()> {
        match &self.mailer {
            Some(mailer) => mailer.send(message).await,
            None => {
                warn!(subject = %message.subject, "no smtp configured; dropping email");
                Ok(())
            }
        }
    }

    async fn webhook(&self, payload: &serde_json::Value) -> Result<()> {
        match &self.webhook {
            Some(client) => client.post(payload).await,
            None => {
                warn!("no webhook configured; dropping event");
                Ok(())
            }
        }
    }
}

/// In-memory notifier for tests: records everything it is handed.
#[derive(Default)]
pub struct MemoryNotifier {
    pub emails: Mutex<Vec<EmailMessage>>,
    pub webhooks: Mutex<Vec<serde_json::Value>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn email_count(&self) -> usize {
        self.emails.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn webhook_count(&self) -> usize {
        self.webhooks.lock().map(|w| w.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn email(&self, message: &EmailMessage) -> Result<()> {
        self.emails
            .lock()
            .map_err(|_| NotifyError::Smtp("poisoned".into()))?
            .push(message.clone());
        Ok(())
    }

    async fn webhook(&self, payload: &serde_json::Value) -> Result<()> {
        self.webhooks
            .lock()
            .map_err(|_| NotifyError::Webhook("poisoned".into()))?
            .push(payload.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_transports_drop_quietly() {
        let notifier = Notifications::new(None, None);
        notifier
            .email(&EmailMessage {
                recipients: vec!["ops@example.com".into()],
                subject: "s".into(),
                body: "b".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        notifier.webhook(&serde_json::json!({"kind": "x"})).await.unwrap();
    }

    #[tokio::test]
    async fn memory_notifier_records() {
        let notifier = MemoryNotifier::new();
        notifier.webhook(&serde_json::json!({"a": 1})).await.unwrap();
        assert_eq!(notifier.webhook_count(), 1);
    }
}
