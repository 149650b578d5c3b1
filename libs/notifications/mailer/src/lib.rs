//! Retrying SMTP mail delivery.
//!
//! [`SmtpMailer`] holds a lazily-built, pooled lettre session;
//! [`DeliveryPipeline`] retries transient failures over any
//! [`MailTransport`] with exponential backoff. Failures classify as
//! transient (connection faults, 4xx SMTP replies) or permanent
//! (5xx replies, malformed messages), and only transient ones retry.
//!
//! ```no_run
//! use mailer::{DeliveryPipeline, Mail, SmtpConfig, SmtpMailer};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SmtpConfig {
//!     host: "smtp.example.com".into(),
//!     from: "Ops <ops@example.com>".into(),
//!     ..SmtpConfig::default()
//! };
//! let pipeline = DeliveryPipeline::new(SmtpMailer::new(config));
//! let receipt = pipeline
//!     .send(Mail::new("Welcome").to("user@example.com").html("<p>Hi!</p>"))
//!     .await?;
//! tracing::info!(message_id = %receipt.message_id, "sent");
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod message;
mod mock;
mod pipeline;
mod text;
mod transport;

pub use config::SmtpConfig;
pub use error::{DeliveryError, DeliveryResult};
pub use message::{DeliveryReceipt, Mail};
pub use mock::MockTransport;
pub use pipeline::DeliveryPipeline;
pub use text::html_to_text;
pub use transport::{MailTransport, SmtpMailer};
