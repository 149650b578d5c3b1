//! Broker client error types.

use thiserror::Error;

/// Errors raised by the broker client.
///
/// Handler failures are not represented here: a job handler returns
/// `eyre::Result<()>` and its error travels unchanged to the worker's
/// failure callback.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Broker transport or command error
    #[error("broker error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Payload serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation on a queue that has already been closed
    #[error("queue '{name}' is closed")]
    QueueClosed { name: String },

    /// A queue name was re-registered with a different payload type.
    ///
    /// A name's payload type is fixed at first registration; asking for the
    /// same name with another type is a programmer error.
    #[error("queue '{name}' is registered with payload type {existing}, requested {requested}")]
    QueueTypeMismatch {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("internal broker error: {0}")]
    Internal(&'static str),
}

impl BrokerError {
    /// Whether the failed operation is worth repeating on a fresh attempt.
    ///
    /// Transport errors may clear once the shared connection recovers;
    /// everything else is a caller error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Redis(_))
    }
}
