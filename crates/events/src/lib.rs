//! Vaultkeep notifications.
//!
//! - [`Notifier`]: the contract the pipeline and scheduler report through.
//! - [`NotificationService`]: fans a message out to every configured channel.
//! - [`delivery`]: the SMTP and Gotify-style webhook channels.

pub mod delivery;
pub mod notification;
pub mod service;

pub use delivery::email::{EmailConfig, EmailDelivery, SmtpSecurity};
pub use delivery::webhook::{WebhookConfig, WebhookDelivery};
pub use notification::Notification;
pub use service::{NotificationService, Notifier};
