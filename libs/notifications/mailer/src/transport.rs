//! SMTP transport built on lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::PoolConfig;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{DeliveryReceipt, Mail};

/// Something that can deliver mail. The pipeline retries over this seam,
/// so tests swap in a scripted mock.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &Mail) -> DeliveryResult<DeliveryReceipt>;

    /// Checks the transport can reach its server.
    async fn verify(&self) -> DeliveryResult<()>;

    fn name(&self) -> &str;
}

/// SMTP delivery over a pooled lettre transport.
///
/// The session is opened lazily on first send and kept for reuse; a
/// failed server is not contacted at construction time.
pub struct SmtpMailer {
    config: SmtpConfig,
    transport: Mutex<Option<AsyncSmtpTransport<Tokio1Executor>>>,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            transport: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Whether a session has been built.
    pub async fn has_session(&self) -> bool {
        self.transport.lock().await.is_some()
    }

    /// Drops the pooled session. The next send builds a fresh one.
    pub async fn close_transport(&self) {
        let mut slot = self.transport.lock().await;
        if slot.take().is_some() {
            info!(host = %self.config.host, "smtp session closed");
        }
    }

    async fn session(&self) -> DeliveryResult<AsyncSmtpTransport<Tokio1Executor>> {
        let mut slot = self.transport.lock().await;
        if let Some(transport) = slot.as_ref() {
            return Ok(transport.clone());
        }

        debug!(host = %self.config.host, port = self.config.port, "building smtp session");
        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
                .port(self.config.port)
                .pool_config(PoolConfig::new().max_size(self.config.pool_size));

        if self.config.implicit_tls() {
            let tls = TlsParameters::new(self.config.host.clone())
                .map_err(DeliveryError::from)?;
            builder = builder.tls(Tls::Wrapper(tls));
        }

        if let (Some(username), Some(password)) =
            (self.config.username.as_ref(), self.config.password.as_ref())
        {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let transport = builder.build();
        *slot = Some(transport.clone());

        // Connectivity probe off the send path; failures only log.
        let probe = transport.clone();
        let host = self.config.host.clone();
        tokio::spawn(async move {
            match probe.test_connection().await {
                Ok(true) => debug!(host = %host, "smtp connection verified"),
                Ok(false) => warn!(host = %host, "smtp server did not respond to probe"),
                Err(err) => warn!(host = %host, error = %err, "smtp probe failed"),
            }
        });

        Ok(transport)
    }

    fn build_message(&self, mail: &Mail) -> DeliveryResult<Message> {
        if mail.to.is_empty() {
            return Err(DeliveryError::Message("no recipients".to_string()));
        }
        if !mail.has_body() {
            return Err(DeliveryError::Message("no body".to_string()));
        }

        let from = self.config.from_mailbox()?;
        let mut builder = Message::builder().from(from).subject(&mail.subject);

        for recipient in &mail.to {
            let mailbox: Mailbox = recipient.parse()?;
            builder = builder.to(mailbox);
        }
        if let Some(reply_to) = &mail.reply_to {
            let mailbox: Mailbox = reply_to.parse()?;
            builder = builder.reply_to(mailbox);
        }

        let message = match (&mail.text, &mail.html) {
            (Some(text), Some(html)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            )?,
            (Some(text), None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone())?,
            (None, Some(html)) => builder
                .header(ContentType::TEXT_HTML)
                .body(html.clone())?,
            (None, None) => unreachable!("body checked above"),
        };
        Ok(message)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, mail: &Mail) -> DeliveryResult<DeliveryReceipt> {
        let message = self.build_message(mail)?;
        let transport = self.session().await?;

        let response = transport.send(message).await.map_err(DeliveryError::from)?;
        let message_id = response
            .message()
            .next()
            .map(|line| line.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(DeliveryReceipt {
            message_id,
            accepted: mail.to.clone(),
            rejected: Vec::new(),
        })
    }

    async fn verify(&self) -> DeliveryResult<()> {
        let transport = self.session().await?;
        match transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryError::Transport(
                "smtp server did not respond".to_string(),
            )),
            Err(err) => Err(DeliveryError::from(err)),
        }
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailer() -> SmtpMailer {
        SmtpMailer::new(SmtpConfig {
            from: "Ops <ops@example.com>".to_string(),
            ..SmtpConfig::default()
        })
    }

    #[tokio::test]
    async fn starts_without_a_session() {
        let mailer = mailer();
        assert!(!mailer.has_session().await);
    }

    #[tokio::test]
    async fn close_without_session_is_a_noop() {
        let mailer = mailer();
        mailer.close_transport().await;
        assert!(!mailer.has_session().await);
    }

    #[tokio::test]
    async fn session_is_rebuilt_after_close() {
        let mailer = mailer();
        mailer.session().await.unwrap();
        assert!(mailer.has_session().await);

        mailer.close_transport().await;
        assert!(!mailer.has_session().await);

        mailer.session().await.unwrap();
        assert!(mailer.has_session().await);
    }

    #[test]
    fn message_requires_recipients_and_body() {
        let mailer = mailer();

        let no_recipients = Mail::new("hi").text("body");
        assert!(matches!(
            mailer.build_message(&no_recipients),
            Err(DeliveryError::Message(_))
        ));

        let no_body = Mail::new("hi").to("a@example.com");
        assert!(matches!(
            mailer.build_message(&no_body),
            Err(DeliveryError::Message(_))
        ));
    }

    #[test]
    fn builds_multipart_when_both_bodies_present() {
        let mailer = mailer();
        let mail = Mail::new("hi")
            .to("a@example.com")
            .text("plain")
            .html("<p>rich</p>");
        let message = mailer.build_message(&mail).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("multipart/alternative"));
    }

    #[test]
    fn bad_recipient_is_a_message_error() {
        let mailer = mailer();
        let mail = Mail::new("hi").to("not an address").text("body");
        assert!(matches!(
            mailer.build_message(&mail),
            Err(DeliveryError::Message(_))
        ));
    }
}
