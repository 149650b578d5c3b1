//! Named queue registry.
//!
//! Queues are created on first use and cached by name. A name's payload
//! type is fixed at first registration; re-requesting the name with a
//! different type is rejected rather than silently handing back a handle
//! that would corrupt the stream.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::connection::BrokerConnection;
use crate::error::BrokerError;
use crate::job::QueuePolicy;
use crate::queue::{ErasedQueue, Queue, QueueControl};

struct QueueEntry {
    type_id: TypeId,
    type_name: &'static str,
    queue: Arc<dyn Any + Send + Sync>,
    control: Arc<dyn QueueControl>,
}

pub struct QueueRegistry {
    connection: BrokerConnection,
    default_policy: QueuePolicy,
    queues: Mutex<HashMap<String, QueueEntry>>,
}

impl QueueRegistry {
    pub fn new(connection: BrokerConnection, default_policy: QueuePolicy) -> Self {
        Self {
            connection,
            default_policy,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the queue registered under `name`, creating it if absent.
    ///
    /// Concurrent callers asking for the same fresh name all receive the
    /// same instance; the registry lock covers the whole check-and-insert.
    pub async fn get_or_create<T>(&self, name: &str) -> Result<Arc<Queue<T>>, BrokerError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut queues = self.queues.lock().await;

        if let Some(entry) = queues.get(name) {
            if entry.type_id != TypeId::of::<T>() {
                return Err(BrokerError::QueueTypeMismatch {
                    name: name.to_string(),
                    existing: entry.type_name,
                    requested: type_name::<T>(),
                });
            }
            return entry
                .queue
                .clone()
                .downcast::<Queue<T>>()
                .map_err(|_| BrokerError::Internal("queue registry type entry out of sync"));
        }

        let queue = Arc::new(Queue::<T>::new(
            name,
            self.connection.clone(),
            self.default_policy.clone(),
        ));
        queues.insert(
            name.to_string(),
            QueueEntry {
                type_id: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                queue: queue.clone(),
                control: Arc::new(ErasedQueue(queue.clone())),
            },
        );
        debug!(queue = %name, payload = type_name::<T>(), "queue registered");
        Ok(queue)
    }

    /// Closes and forgets the named queue. Unknown names are a no-op.
    pub async fn close(&self, name: &str) {
        let entry = self.queues.lock().await.remove(name);
        if let Some(entry) = entry {
            entry.control.close().await;
        }
    }

    /// Closes every registered queue concurrently and empties the registry.
    pub async fn close_all(&self) {
        let entries: Vec<QueueEntry> = {
            let mut queues = self.queues.lock().await;
            queues.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }
        let count = entries.len();
        join_all(entries.iter().map(|entry| entry.control.close())).await;
        info!(count, "all queues closed");
    }

    pub async fn len(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queues.lock().await.is_empty()
    }
}
