//! Retrying delivery pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::DeliveryResult;
use crate::message::{DeliveryReceipt, Mail};
use crate::text::html_to_text;
use crate::transport::MailTransport;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Drives a transport with bounded retries.
///
/// Only transient failures are retried; the delay doubles per attempt
/// from the base. The last error is returned unchanged, so callers see
/// the transport's own classification rather than a retry wrapper.
pub struct DeliveryPipeline<T: MailTransport> {
    transport: Arc<T>,
    max_attempts: u32,
    base_delay: Duration,
}

impl<T: MailTransport> DeliveryPipeline<T> {
    pub fn new(transport: T) -> Self {
        Self::with_arc(Arc::new(transport))
    }

    pub fn with_arc(transport: Arc<T>) -> Self {
        Self {
            transport,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Delivers the message, retrying transient failures.
    ///
    /// An html-only message gets a derived text alternative before the
    /// first attempt so every retry sends the same bytes.
    pub async fn send(&self, mail: Mail) -> DeliveryResult<DeliveryReceipt> {
        let mut mail = mail;
        if mail.text.is_none() {
            if let Some(html) = &mail.html {
                mail.text = Some(html_to_text(html));
            }
        }

        let mut attempt = 1;
        loop {
            match self.transport.send(&mail).await {
                Ok(receipt) => {
                    info!(
                        transport = self.transport.name(),
                        message_id = %receipt.message_id,
                        accepted = receipt.accepted.len(),
                        attempt,
                        "mail delivered"
                    );
                    return Ok(receipt);
                }
                Err(err) => {
                    if attempt >= self.max_attempts || !err.is_transient() {
                        return Err(err);
                    }
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        transport = self.transport.name(),
                        attempt,
                        max_attempts = self.max_attempts,
                        retry_in = ?delay,
                        error = %err,
                        "delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::mock::MockTransport;
    use std::io;
    use tokio::time::Instant;

    fn mail() -> Mail {
        Mail::new("hi").to("a@example.com").text("body")
    }

    fn timeout() -> DeliveryError {
        DeliveryError::Network {
            kind: io::ErrorKind::TimedOut,
            message: "slow".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_doubling_delay() {
        let transport = MockTransport::new();
        transport.fail_next(timeout()).await;
        transport.fail_next(timeout()).await;

        let pipeline = DeliveryPipeline::with_arc(Arc::new(transport.clone()));
        let start = Instant::now();
        let receipt = pipeline.send(mail()).await.unwrap();

        // 1000ms after the first failure, 2000ms after the second.
        assert_eq!(start.elapsed(), Duration::from_millis(3000));
        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.sent_count().await, 1);
        assert!(!receipt.message_id.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let transport = MockTransport::new();
        transport
            .fail_next(DeliveryError::Protocol {
                code: 550,
                message: "no such user".to_string(),
            })
            .await;

        let pipeline = DeliveryPipeline::with_arc(Arc::new(transport.clone()));
        let start = Instant::now();
        let err = pipeline.send(mail()).await.unwrap_err();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(transport.attempts(), 1);
        assert!(matches!(err, DeliveryError::Protocol { code: 550, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_capped_and_last_error_surfaces() {
        let transport = MockTransport::new();
        for _ in 0..5 {
            transport.fail_next(timeout()).await;
        }

        let pipeline = DeliveryPipeline::with_arc(Arc::new(transport.clone()));
        let err = pipeline.send(mail()).await.unwrap_err();

        assert_eq!(transport.attempts(), 3);
        assert!(matches!(err, DeliveryError::Network { kind, .. } if kind == io::ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn html_only_mail_gains_a_text_alternative() {
        let transport = MockTransport::new();
        let pipeline = DeliveryPipeline::with_arc(Arc::new(transport.clone()));

        let mail = Mail::new("hi").to("a@example.com").html("<p>rich</p>");
        pipeline.send(mail).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent[0].text.as_deref(), Some("rich"));
        assert_eq!(sent[0].html.as_deref(), Some("<p>rich</p>"));
    }

    #[tokio::test]
    async fn explicit_text_is_left_alone() {
        let transport = MockTransport::new();
        let pipeline = DeliveryPipeline::with_arc(Arc::new(transport.clone()));

        let mail = Mail::new("hi")
            .to("a@example.com")
            .text("handwritten")
            .html("<p>rich</p>");
        pipeline.send(mail).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent[0].text.as_deref(), Some("handwritten"));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_base_delay_is_honored() {
        let transport = MockTransport::new();
        transport.fail_next(timeout()).await;

        let pipeline = DeliveryPipeline::with_arc(Arc::new(transport.clone()))
            .base_delay(Duration::from_millis(50));
        let start = Instant::now();
        pipeline.send(mail()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }
}
