//! Job envelopes, enqueue options, and retry policy.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Retry backoff strategy baked into a job's options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    pub delay: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl BackoffPolicy {
    pub fn fixed(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay in milliseconds before attempt `attempts_made + 1`.
    ///
    /// Exponential doubling: base, 2x base, 4x base, ... The shift is
    /// capped so a long retry chain cannot overflow.
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let shift = attempts_made.saturating_sub(1).min(20);
                self.delay.saturating_mul(1u64 << shift)
            }
        }
    }
}

/// Per-job enqueue options. Unset fields fall back to the queue policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Milliseconds to wait before the job becomes runnable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,

    /// Lower values run first within a fetched batch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Total attempts before the job is parked as failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,

    /// Caller-supplied identifier; duplicates are dropped at enqueue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn with_delay(mut self, millis: u64) -> Self {
        self.delay = Some(millis);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Queue-level defaults applied to every job at enqueue time.
///
/// Defaults are baked into the envelope by the producer, so a worker
/// started with a different policy still honors what the producer chose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// How many completed jobs to keep for inspection
    pub keep_completed: usize,
    /// How many failed jobs to keep for inspection
    pub keep_failed: usize,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::exponential(1000),
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl QueuePolicy {
    /// Fills unset job options from the queue defaults.
    pub fn apply(&self, mut opts: JobOptions) -> JobOptions {
        if opts.attempts.is_none() {
            opts.attempts = Some(self.attempts);
        }
        if opts.backoff.is_none() {
            opts.backoff = Some(self.backoff.clone());
        }
        opts
    }
}

/// Wire form of a job as stored on the broker stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope<T> {
    pub id: String,
    pub queue_name: String,
    pub data: T,
    pub opts: JobOptions,
    #[serde(default)]
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl<T: Serialize> JobEnvelope<T> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl<T: DeserializeOwned> JobEnvelope<T> {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// A job as seen by a handler: envelope contents plus the broker's own
/// entry id for the current delivery.
#[derive(Debug, Clone)]
pub struct Job<T> {
    /// Broker stream entry id for this delivery
    pub id: String,
    /// Stable job identifier, constant across retries
    pub job_id: String,
    pub queue_name: String,
    pub data: T,
    pub opts: JobOptions,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> Job<T> {
    pub(crate) fn from_envelope(stream_id: String, envelope: JobEnvelope<T>) -> Self {
        Self {
            id: stream_id,
            job_id: envelope.id,
            queue_name: envelope.queue_name,
            data: envelope.data,
            opts: envelope.opts,
            attempts_made: envelope.attempts_made,
            enqueued_at: envelope.enqueued_at,
        }
    }

    /// When this delivery becomes runnable.
    pub fn runnable_at(&self) -> DateTime<Utc> {
        let delay = self.opts.delay.unwrap_or(0);
        self.enqueued_at + chrono::Duration::milliseconds(delay as i64)
    }
}

pub(crate) fn stream_key(queue_name: &str) -> String {
    format!("jobs:{queue_name}")
}

pub(crate) fn dedup_key(queue_name: &str, job_id: &str) -> String {
    format!("jobs:{queue_name}:dedup:{job_id}")
}

pub(crate) fn completed_key(queue_name: &str) -> String {
    format!("jobs:{queue_name}:completed")
}

pub(crate) fn failed_key(queue_name: &str) -> String {
    format!("jobs:{queue_name}:failed")
}

pub(crate) const CONSUMER_GROUP: &str = "workers";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape_is_camel_case() {
        let envelope = JobEnvelope {
            id: "a1".to_string(),
            queue_name: "email".to_string(),
            data: serde_json::json!({"to": "x@example.com"}),
            opts: JobOptions::default()
                .with_attempts(3)
                .with_backoff(BackoffPolicy::exponential(1000)),
            attempts_made: 0,
            enqueued_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };

        let json: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(json["queueName"], "email");
        assert_eq!(json["attemptsMade"], 0);
        assert_eq!(json["opts"]["attempts"], 3);
        assert_eq!(json["opts"]["backoff"]["type"], "exponential");
        assert_eq!(json["opts"]["backoff"]["delay"], 1000);
        assert!(json["opts"].get("delay").is_none());
        assert!(json.get("enqueuedAt").is_some());
    }

    #[test]
    fn attempts_made_defaults_to_zero_on_decode() {
        let raw = r#"{
            "id": "a1",
            "queueName": "email",
            "data": 7,
            "opts": {},
            "enqueuedAt": "2026-01-01T00:00:00Z"
        }"#;
        let envelope: JobEnvelope<u32> = JobEnvelope::from_json(raw).unwrap();
        assert_eq!(envelope.attempts_made, 0);
        assert_eq!(envelope.data, 7);
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = BackoffPolicy::exponential(1000);
        assert_eq!(backoff.delay_for(1), 1000);
        assert_eq!(backoff.delay_for(2), 2000);
        assert_eq!(backoff.delay_for(3), 4000);
    }

    #[test]
    fn exponential_backoff_does_not_overflow() {
        let backoff = BackoffPolicy::exponential(u64::MAX / 2);
        assert_eq!(backoff.delay_for(64), u64::MAX);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = BackoffPolicy::fixed(500);
        assert_eq!(backoff.delay_for(1), 500);
        assert_eq!(backoff.delay_for(9), 500);
    }

    #[test]
    fn policy_fills_only_unset_options() {
        let policy = QueuePolicy::default();
        let opts = policy.apply(JobOptions::default().with_attempts(7));
        assert_eq!(opts.attempts, Some(7));
        assert_eq!(opts.backoff, Some(BackoffPolicy::exponential(1000)));
    }

    #[test]
    fn key_layout() {
        assert_eq!(stream_key("email"), "jobs:email");
        assert_eq!(dedup_key("email", "j1"), "jobs:email:dedup:j1");
        assert_eq!(completed_key("email"), "jobs:email:completed");
        assert_eq!(failed_key("email"), "jobs:email:failed");
    }
}
