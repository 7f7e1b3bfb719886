//! Email notification delivery via SMTP.
//!
//! [`EmailDelivery`] wraps the `lettre` async SMTP transport to send
//! plain-text backup notifications. Configuration is loaded from environment
//! variables; if `SMTP_HOST` is not set, [`EmailConfig::from_env`] returns
//! `None` and no mailer should be constructed.

use std::time::Duration;

use vaultkeep_core::secret::Secret;

use crate::notification::Notification;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for email delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    /// SMTP transport-level failure (authentication, connection, etc.).
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    /// The recipient or sender address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The MIME message could not be assembled.
    #[error("Email build error: {0}")]
    Build(String),
}

// ---------------------------------------------------------------------------
// EmailConfig
// ---------------------------------------------------------------------------

/// Default SMTP port for STARTTLS and plain connections.
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default SMTP port for implicit TLS.
const DEFAULT_SMTPS_PORT: u16 = 465;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "vaultkeep@localhost";

/// Connection and command timeout for one delivery.
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS.
    #[default]
    Starttls,
    /// Implicit TLS from the first byte.
    Ssl,
    /// No transport security.
    None,
}

impl SmtpSecurity {
    /// Parse a case-insensitive `SMTP_SECURITY` value. Unknown values fall
    /// back to STARTTLS.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "SSL" | "TLS" => Self::Ssl,
            "NONE" | "PLAIN" => Self::None,
            _ => Self::Starttls,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Self::Ssl => DEFAULT_SMTPS_PORT,
            Self::Starttls | Self::None => DEFAULT_SMTP_PORT,
        }
    }
}

/// Configuration for the SMTP email delivery service.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// SMTP server hostname.
    pub smtp_host: String,
    /// SMTP server port (defaults by security mode).
    pub smtp_port: u16,
    pub security: SmtpSecurity,
    /// RFC 5322 "From" address.
    pub from_address: String,
    /// Recipient address. Defaults to the sender.
    pub to_address: String,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<Secret>,
}

impl EmailConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns `None` if `SMTP_HOST` is not set, signalling that email
    /// delivery is not configured and should be skipped.
    ///
    /// | Variable        | Required | Default                          |
    /// |-----------------|----------|----------------------------------|
    /// | `SMTP_HOST`     | yes      |                                  |
    /// | `SMTP_SECURITY` | no       | `STARTTLS` (`SSL`, `NONE`)       |
    /// | `SMTP_PORT`     | no       | `465` for `SSL`, else `587`      |
    /// | `SMTP_FROM`     | no       | `vaultkeep@localhost`            |
    /// | `SMTP_TO`       | no       | the sender                       |
    /// | `SMTP_USER`     | no       |                                  |
    /// | `SMTP_PASSWORD` | no       |                                  |
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let smtp_host = lookup("SMTP_HOST").filter(|h| !h.trim().is_empty())?;
        let security = lookup("SMTP_SECURITY")
            .map(|s| SmtpSecurity::parse(&s))
            .unwrap_or_default();
        let from_address =
            lookup("SMTP_FROM").unwrap_or_else(|| DEFAULT_FROM_ADDRESS.to_string());
        Some(Self {
            smtp_host,
            smtp_port: lookup("SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or_else(|| security.default_port()),
            security,
            to_address: lookup("SMTP_TO").unwrap_or_else(|| from_address.clone()),
            from_address,
            smtp_user: lookup("SMTP_USER"),
            smtp_password: lookup("SMTP_PASSWORD").map(Secret::from),
        })
    }
}

// ---------------------------------------------------------------------------
// EmailDelivery
// ---------------------------------------------------------------------------

/// Sends notification emails via SMTP.
pub struct EmailDelivery {
    config: EmailConfig,
}

impl EmailDelivery {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmailConfig {
        &self.config
    }

    /// Send one notification to the configured recipient.
    pub async fn deliver(&self, notification: &Notification) -> Result<(), EmailError> {
        use lettre::{
            message::header::ContentType, transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let email = Message::builder()
            .from(self.config.from_address.parse()?)
            .to(self.config.to_address.parse()?)
            .subject(notification.title())
            .header(ContentType::TEXT_PLAIN)
            .body(render_body(notification))
            .map_err(|e| EmailError::Build(e.to_string()))?;

        let host = self.config.smtp_host.as_str();
        let mut transport_builder = match self.config.security {
            SmtpSecurity::Ssl => AsyncSmtpTransport::<Tokio1Executor>::relay(host)?,
            SmtpSecurity::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?,
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        }
        .port(self.config.smtp_port)
        .timeout(Some(SMTP_TIMEOUT));

        if let (Some(user), Some(pass)) = (&self.config.smtp_user, &self.config.smtp_password) {
            transport_builder = transport_builder
                .credentials(Credentials::new(user.clone(), pass.expose().to_string()));
        }

        let mailer = transport_builder.build();
        mailer.send(email).await?;

        tracing::info!(
            to = %self.config.to_address,
            subject = %notification.subject,
            "Notification email sent"
        );
        Ok(())
    }
}

/// Plain-text body with a status header and footer.
pub fn render_body(notification: &Notification) -> String {
    format!(
        "Vaultkeep Backup Notification\n\n\
         Time: {}\n\
         Host: {}\n\
         Status: {}\n\n\
         {}\n\n\
         ---\n\
         This notification was sent by the Vaultkeep backup scheduler.\n",
        notification.time_label(),
        notification.host,
        notification.status_label(),
        notification.body,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
