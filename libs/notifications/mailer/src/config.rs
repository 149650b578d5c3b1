//! SMTP transport configuration.

use core_config::{ConfigError, FromEnv, env_or_default, env_parse_or, env_required};
use lettre::message::Mailbox;

use crate::error::DeliveryError;

/// Configuration for the SMTP transport.
///
/// `from` accepts a bare address or the `Name <address>` form. Port 465
/// selects implicit TLS; everything else speaks plaintext or STARTTLS as
/// the server offers it.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    /// Connections kept in the transport pool
    pub pool_size: u32,
    /// Advisory cap on messages per pooled connection
    pub max_messages: u32,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            username: None,
            password: None,
            from: "noreply@localhost".to_string(),
            pool_size: 5,
            max_messages: 100,
        }
    }
}

impl SmtpConfig {
    /// Parses the configured sender into a mailbox, validating it.
    pub fn from_mailbox(&self) -> Result<Mailbox, DeliveryError> {
        self.from
            .parse::<Mailbox>()
            .map_err(|err| DeliveryError::Message(format!("invalid from address: {err}")))
    }

    pub fn implicit_tls(&self) -> bool {
        self.port == 465
    }
}

impl FromEnv for SmtpConfig {
    /// Load from `SMTP_HOST`, `SMTP_PORT`, `SMTP_USERNAME`,
    /// `SMTP_PASSWORD`, `MAIL_FROM`, `SMTP_POOL_SIZE`,
    /// `SMTP_MAX_MESSAGES`. Only the host and sender are required.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_required("SMTP_HOST")?,
            port: env_parse_or("SMTP_PORT", 587)?,
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
            from: env_or_default("MAIL_FROM", "noreply@localhost"),
            pool_size: env_parse_or("SMTP_POOL_SIZE", 5)?,
            max_messages: env_parse_or("SMTP_MAX_MESSAGES", 100)?,
        })
    }
}
