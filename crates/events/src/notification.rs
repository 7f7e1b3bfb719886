//! The message envelope handed to delivery channels.

use chrono::Utc;
use vaultkeep_core::types::Timestamp;

/// Prefix applied to every subject line and webhook title.
pub const SUBJECT_PREFIX: &str = "[Vaultkeep]";

/// A single notification, stamped when it is created.
#[derive(Debug, Clone)]
pub struct Notification {
    pub subject: String,
    pub body: String,
    pub is_error: bool,
    pub host: String,
    pub timestamp: Timestamp,
}

impl Notification {
    pub fn new(subject: &str, body: &str, is_error: bool) -> Self {
        Self {
            subject: subject.to_string(),
            body: body.to_string(),
            is_error,
            host: hostname(),
            timestamp: Utc::now(),
        }
    }

    /// Subject line with the product prefix.
    pub fn title(&self) -> String {
        format!("{SUBJECT_PREFIX} {}", self.subject)
    }

    pub fn status_label(&self) -> &'static str {
        if self.is_error {
            "ERROR"
        } else {
            "SUCCESS"
        }
    }

    /// Formatted timestamp used in message bodies.
    pub fn time_label(&self) -> String {
        self.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }
}

/// Best-effort host name: `$HOSTNAME`, then `/etc/hostname`, then `unknown`.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
