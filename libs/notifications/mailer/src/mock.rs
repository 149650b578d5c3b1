//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};
use crate::message::{DeliveryReceipt, Mail};
use crate::transport::MailTransport;

/// Transport that records sends and fails on cue.
///
/// Clones share state, so a test can hand one clone to the pipeline and
/// inspect the other.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    sent: Mutex<Vec<Mail>>,
    scripted_failures: Mutex<VecDeque<DeliveryError>>,
    attempts: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error to be returned by the next send attempt. Errors
    /// are consumed in order; once drained, sends succeed.
    pub async fn fail_next(&self, error: DeliveryError) {
        self.state.scripted_failures.lock().await.push_back(error);
    }

    /// Total send attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    pub async fn sent(&self) -> Vec<Mail> {
        self.state.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.state.sent.lock().await.len()
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn send(&self, mail: &Mail) -> DeliveryResult<DeliveryReceipt> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.state.scripted_failures.lock().await.pop_front() {
            return Err(error);
        }

        self.state.sent.lock().await.push(mail.clone());
        Ok(DeliveryReceipt {
            message_id: Uuid::new_v4().to_string(),
            accepted: mail.to.clone(),
            rejected: Vec::new(),
        })
    }

    async fn verify(&self) -> DeliveryResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn records_successful_sends() {
        let transport = MockTransport::new();
        let mail = Mail::new("hi").to("a@example.com").text("body");
        transport.send(&mail).await.unwrap();
        assert_eq!(transport.sent_count().await, 1);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let transport = MockTransport::new();
        transport
            .fail_next(DeliveryError::Network {
                kind: io::ErrorKind::TimedOut,
                message: "slow".to_string(),
            })
            .await;

        let mail = Mail::new("hi").to("a@example.com").text("body");
        assert!(transport.send(&mail).await.is_err());
        assert!(transport.send(&mail).await.is_ok());
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.sent_count().await, 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let transport = MockTransport::new();
        let clone = transport.clone();
        let mail = Mail::new("hi").to("a@example.com").text("body");
        clone.send(&mail).await.unwrap();
        assert_eq!(transport.sent_count().await, 1);
    }
}
