//! Shared broker connection.
//!
//! One [`BrokerConnection`] is shared by every queue and worker. The
//! underlying connection is opened lazily on first use and multiplexes all
//! commands, so producers and consumers never hold per-object sockets.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::BrokerError;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Handle to the shared broker connection.
///
/// Cheap to clone; all clones share one live connection slot.
#[derive(Clone)]
pub struct BrokerConnection {
    url: String,
    inner: Arc<Mutex<Option<ConnectionManager>>>,
}

impl BrokerConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            inner: Arc::new(Mutex::new(None)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the live connection, establishing it on first use.
    ///
    /// A freshly opened connection is verified with PING before being
    /// handed out, so callers see connect failures here rather than on
    /// their first real command.
    pub async fn acquire(&self) -> Result<ConnectionManager, BrokerError> {
        let mut slot = self.inner.lock().await;
        if let Some(manager) = slot.as_ref() {
            return Ok(manager.clone());
        }

        debug!(url = %self.url, "opening broker connection");
        let client = redis::Client::open(self.url.as_str())?;

        // Probe once so an unreachable broker fails this caller instead
        // of spinning inside the manager's reconnect loop.
        drop(client.get_multiplexed_async_connection().await?);

        // Reconnects retry forever with capped exponential backoff; a
        // dropped broker must not permanently fail later commands.
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(usize::MAX)
            .set_max_delay(Duration::from_millis(MAX_RECONNECT_DELAY_MS));
        let mut manager = ConnectionManager::new_with_config(client, config).await?;

        let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
        debug!(response = %pong, "broker connection verified");

        *slot = Some(manager.clone());
        info!(url = %self.url, "broker connection established");
        Ok(manager)
    }

    /// Whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Closes the connection, sending a best-effort QUIT first.
    ///
    /// Never raises: if the server does not acknowledge QUIT within
    /// [`CLOSE_TIMEOUT`] the connection is dropped anyway. Safe to call
    /// repeatedly; later calls are no-ops.
    pub async fn close(&self) {
        let mut slot = self.inner.lock().await;
        let Some(mut manager) = slot.take() else {
            return;
        };

        let quit_cmd = redis::cmd("QUIT");
        let quit = quit_cmd.query_async::<String>(&mut manager);
        match tokio::time::timeout(CLOSE_TIMEOUT, quit).await {
            Ok(Ok(_)) => info!("broker connection closed"),
            Ok(Err(err)) => {
                warn!(error = %err, "QUIT failed, forcing disconnect")
            }
            Err(_) => {
                warn!(timeout = ?CLOSE_TIMEOUT, "QUIT timed out, forcing disconnect")
            }
        }
        drop(manager);
    }

    /// Drops the current connection and opens a fresh one.
    pub async fn replace(&self) -> Result<ConnectionManager, BrokerError> {
        self.close().await;
        self.acquire().await
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected() {
        let conn = BrokerConnection::new("redis://127.0.0.1:6379");
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn close_without_connection_is_a_noop() {
        let conn = BrokerConnection::new("redis://127.0.0.1:6379");
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_connected().await);
    }

    #[tokio::test]
    async fn acquire_fails_fast_on_unreachable_broker() {
        let conn = BrokerConnection::new("redis://127.0.0.1:1");
        let result = conn.acquire().await;
        assert!(matches!(result, Err(BrokerError::Redis(_))));
        assert!(!conn.is_connected().await);
    }
}
