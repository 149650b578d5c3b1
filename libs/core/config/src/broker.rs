//! Job broker connection settings.

use crate::{ConfigError, FromEnv, env_or_default};

const DEFAULT_BROKER_URL: &str = "redis://127.0.0.1:6379";

/// Connection settings for the job broker.
///
/// The broker is addressed by URL only; authentication is carried in the URL
/// (e.g. `redis://:password@host:6379/0`). Client-side retry policy is not
/// configured here: the shared connection reconnects on its own, and all
/// job-level retry policy belongs to the queue/worker layer.
#[derive(Clone, Debug)]
pub struct BrokerSettings {
    /// Broker connection URL
    pub url: String,
}

impl BrokerSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FromEnv for BrokerSettings {
    /// Load from `BROKER_URL`, falling back to `REDIS_URL`, then localhost.
    fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("BROKER_URL")
            .unwrap_or_else(|_| env_or_default("REDIS_URL", DEFAULT_BROKER_URL));
        Ok(Self { url })
    }
}
