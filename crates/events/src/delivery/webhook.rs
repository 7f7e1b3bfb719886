//! Gotify-style webhook delivery with exponential-backoff retry.
//!
//! [`WebhookDelivery`] POSTs a JSON message (`title`, `message`, `priority`,
//! `extras`) to the configured URL. Failed attempts are retried up to three
//! times with exponential backoff (1 s, 2 s, 4 s).

use std::time::Duration;

use vaultkeep_core::secret::Secret;

use crate::notification::Notification;

/// Retry delays in seconds (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Gotify priority values for the named levels.
const PRIORITY_LOW: u8 = 1;
const PRIORITY_NORMAL: u8 = 5;
const PRIORITY_HIGH: u8 = 10;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),
}

// ---------------------------------------------------------------------------
// WebhookConfig
// ---------------------------------------------------------------------------

/// Where and how loudly to post notifications.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Application token, sent as the `token` query parameter.
    pub token: Option<Secret>,
    pub success_priority: u8,
    pub error_priority: u8,
}

impl WebhookConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `WEBHOOK_URL` is not set.
    ///
    /// | Variable                 | Default  |
    /// |--------------------------|----------|
    /// | `WEBHOOK_URL`            | required |
    /// | `WEBHOOK_TOKEN`          | none     |
    /// | `WEBHOOK_PRIORITY`       | `normal` |
    /// | `WEBHOOK_ERROR_PRIORITY` | `high`   |
    ///
    /// Priorities accept `low`, `normal`, `high` or a number.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let url = lookup("WEBHOOK_URL").filter(|u| !u.trim().is_empty())?;
        Some(Self {
            url,
            token: lookup("WEBHOOK_TOKEN")
                .filter(|t| !t.is_empty())
                .map(Secret::from),
            success_priority: lookup("WEBHOOK_PRIORITY")
                .and_then(|p| parse_priority(&p))
                .unwrap_or(PRIORITY_NORMAL),
            error_priority: lookup("WEBHOOK_ERROR_PRIORITY")
                .and_then(|p| parse_priority(&p))
                .unwrap_or(PRIORITY_HIGH),
        })
    }

    fn priority_for(&self, is_error: bool) -> u8 {
        if is_error {
            self.error_priority
        } else {
            self.success_priority
        }
    }
}

/// Map a priority name or number to a Gotify priority.
pub fn parse_priority(value: &str) -> Option<u8> {
    match value.trim().to_ascii_lowercase().as_str() {
        "low" => Some(PRIORITY_LOW),
        "normal" => Some(PRIORITY_NORMAL),
        "high" => Some(PRIORITY_HIGH),
        other => other.parse().ok(),
    }
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Delivers notifications to a Gotify-compatible endpoint.
pub struct WebhookDelivery {
    client: reqwest::Client,
    config: WebhookConfig,
    retry_delays: Vec<Duration>,
}

impl WebhookDelivery {
    /// Create a delivery service with a pre-configured HTTP client.
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            config,
            retry_delays: RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        })
    }

    /// Override the backoff schedule.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Deliver a notification with retry.
    ///
    /// Returns `Ok(())` on the first successful attempt.
    pub async fn deliver(&self, notification: &Notification) -> Result<(), WebhookError> {
        let payload = self.payload(notification);
        let mut last_err: Option<WebhookError> = None;

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            match self.try_send(&payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        url = %self.config.url,
                        error = %e,
                        "Webhook delivery attempt failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        // Final attempt after the last backoff.
        match self.try_send(&payload).await {
            Ok(()) => {
                tracing::info!(subject = %notification.subject, "Webhook notification sent");
                Ok(())
            }
            Err(e) => {
                tracing::error!(url = %self.config.url, error = %e, "Webhook delivery failed after all retries");
                Err(last_err.unwrap_or(e))
            }
        }
    }

    /// Gotify message body.
    pub fn payload(&self, notification: &Notification) -> serde_json::Value {
        serde_json::json!({
            "title": notification.title(),
            "message": format!(
                "{}\n\nHost: {}\nTime: {}",
                notification.body,
                notification.host,
                notification.time_label()
            ),
            "priority": self.config.priority_for(notification.is_error),
            "extras": {
                "client::display": { "contentType": "text/markdown" }
            },
        })
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(&self, payload: &serde_json::Value) -> Result<(), WebhookError> {
        let mut request = self.client.post(&self.config.url).json(payload);
        if let Some(token) = &self.config.token {
            request = request.query(&[("token", token.expose())]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
