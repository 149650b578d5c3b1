//! Named worker registry.
//!
//! Workers are registered under a name (the queue name unless overridden).
//! Registering a name that is already taken replaces the incumbent: the
//! old worker is stopped and fully awaited before the new one starts, so
//! two workers never run under one name.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::BrokerConnection;
use crate::worker::{JobHandler, Worker, WorkerOptions};

struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct WorkerRegistry {
    connection: BrokerConnection,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new(connection: BrokerConnection) -> Self {
        Self {
            connection,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a worker for `queue_name` and registers it.
    ///
    /// Returns the effective registry name. The registry lock is held
    /// across the replacement, so concurrent starts under one name
    /// serialize and the last one wins.
    pub async fn start<T, H>(
        &self,
        queue_name: &str,
        handler: H,
        options: WorkerOptions,
    ) -> String
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: JobHandler<T> + 'static,
    {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| queue_name.to_string());

        let mut workers = self.workers.lock().await;
        if let Some(existing) = workers.remove(&name) {
            info!(worker = %name, "replacing existing worker");
            stop_handle(&name, existing).await;
        }

        let worker = Worker::new(
            queue_name,
            self.connection.clone(),
            Arc::new(handler),
            options,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(shutdown_rx));
        workers.insert(
            name.clone(),
            WorkerHandle {
                shutdown: shutdown_tx,
                task,
            },
        );
        info!(worker = %name, queue = %queue_name, "worker registered");
        name
    }

    /// Stops and forgets the named worker, waiting for its in-flight jobs.
    /// Unknown names are a no-op.
    pub async fn stop(&self, name: &str) {
        let handle = self.workers.lock().await.remove(name);
        if let Some(handle) = handle {
            stop_handle(name, handle).await;
        }
    }

    /// Stops every worker concurrently and empties the registry.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, WorkerHandle)> = {
            let mut workers = self.workers.lock().await;
            workers.drain().collect()
        };
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { stop_handle(&name, handle).await }),
        )
        .await;
        info!(count, "all workers stopped");
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.lock().await.is_empty()
    }
}

async fn stop_handle(name: &str, handle: WorkerHandle) {
    let _ = handle.shutdown.send(true);
    if let Err(err) = handle.task.await {
        warn!(worker = %name, error = %err, "worker task did not exit cleanly");
    } else {
        info!(worker = %name, "worker stopped");
    }
}
