//! The [`Notifier`] contract and its fan-out implementation.

use async_trait::async_trait;

use crate::delivery::email::{EmailConfig, EmailDelivery};
use crate::delivery::webhook::{WebhookConfig, WebhookDelivery};
use crate::notification::Notification;

/// Reports backup outcomes to operators.
///
/// `send` is fire-and-forget: implementations swallow and log their own
/// failures so a broken channel can never fail a backup.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str, is_error: bool);
}

/// Delivers each notification to every configured channel.
///
/// With no channels configured, `send` only logs.
#[derive(Default)]
pub struct NotificationService {
    email: Option<EmailDelivery>,
    webhook: Option<WebhookDelivery>,
}

impl NotificationService {
    pub fn new(email: Option<EmailDelivery>, webhook: Option<WebhookDelivery>) -> Self {
        Self { email, webhook }
    }

    /// Build channels from `SMTP_*` and `WEBHOOK_*` variables.
    pub fn from_env() -> Self {
        let email = EmailConfig::from_env().map(EmailDelivery::new);
        let webhook = WebhookConfig::from_env().and_then(|config| {
            WebhookDelivery::new(config)
                .inspect_err(|e| tracing::error!(error = %e, "Failed to build webhook client"))
                .ok()
        });
        tracing::info!(
            email = email.is_some(),
            webhook = webhook.is_some(),
            "Notification channels configured"
        );
        Self { email, webhook }
    }

    pub fn has_channels(&self) -> bool {
        self.email.is_some() || self.webhook.is_some()
    }
}

#[async_trait]
impl Notifier for NotificationService {
    async fn send(&self, subject: &str, body: &str, is_error: bool) {
        if !self.has_channels() {
            tracing::debug!(subject, "No notification channels configured, skipping");
            return;
        }
        let notification = Notification::new(subject, body, is_error);

        let email = async {
            if let Some(email) = &self.email {
                if let Err(e) = email.deliver(&notification).await {
                    tracing::error!(error = %e, subject, "Email notification failed");
                }
            }
        };
        let webhook = async {
            if let Some(webhook) = &self.webhook {
                if let Err(e) = webhook.deliver(&notification).await {
                    tracing::error!(error = %e, subject, "Webhook notification failed");
                }
            }
        };
        tokio::join!(email, webhook);
    }
}
