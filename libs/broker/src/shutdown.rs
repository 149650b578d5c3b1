//! Broker facade and ordered shutdown.

use std::sync::Arc;

use core_config::FromEnv;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::connection::BrokerConnection;
use crate::error::BrokerError;
use crate::job::QueuePolicy;
use crate::queue::Queue;
use crate::queue_registry::QueueRegistry;
use crate::worker::{JobHandler, WorkerOptions};
use crate::worker_registry::WorkerRegistry;

/// Entry point for the job layer: one shared connection, the queue and
/// worker registries built on it, and the shutdown sequence that tears
/// everything down in order.
pub struct JobBroker {
    connection: BrokerConnection,
    queues: QueueRegistry,
    workers: WorkerRegistry,
}

impl JobBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_policy(url, QueuePolicy::default())
    }

    /// Builds a broker from `BROKER_URL`/`REDIS_URL`.
    pub fn from_env() -> Result<Self, core_config::ConfigError> {
        let settings = core_config::broker::BrokerSettings::from_env()?;
        Ok(Self::new(settings.url))
    }

    pub fn with_policy(url: impl Into<String>, policy: QueuePolicy) -> Self {
        let connection = BrokerConnection::new(url);
        Self {
            queues: QueueRegistry::new(connection.clone(), policy),
            workers: WorkerRegistry::new(connection.clone()),
            connection,
        }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Shorthand for `queues().get_or_create`.
    pub async fn queue<T>(&self, name: &str) -> Result<Arc<Queue<T>>, BrokerError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.queues.get_or_create(name).await
    }

    /// Shorthand for `workers().start`.
    pub async fn start_worker<T, H>(
        &self,
        queue_name: &str,
        handler: H,
        options: WorkerOptions,
    ) -> String
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: JobHandler<T> + 'static,
    {
        self.workers.start(queue_name, handler, options).await
    }

    /// Stops everything in dependency order: workers first so no handler
    /// is mid-flight, then queues, then the connection itself. Each phase
    /// is fully awaited before the next begins. Never raises; phases log
    /// their own trouble and the sequence always runs to the end.
    pub async fn shutdown(&self) {
        info!("broker shutdown started");
        self.workers.stop_all().await;
        self.queues.close_all().await;
        self.connection.close().await;
        info!("broker shutdown complete");
    }
}
