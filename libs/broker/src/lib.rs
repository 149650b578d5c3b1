//! Job broker client on top of Redis Streams.
//!
//! One [`JobBroker`] owns a single multiplexed connection shared by every
//! queue and worker. Producers enqueue typed payloads through
//! [`Queue`] handles obtained from the queue registry; consumers register
//! [`JobHandler`] implementations through the worker registry and the
//! broker drives retries with per-job backoff. [`JobBroker::shutdown`]
//! tears the whole layer down in dependency order.
//!
//! ```no_run
//! use broker::{JobBroker, JobHandler, Job, JobOptions, WorkerOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Welcome { user_id: String }
//!
//! struct WelcomeHandler;
//!
//! #[async_trait::async_trait]
//! impl JobHandler<Welcome> for WelcomeHandler {
//!     async fn handle(&self, job: &Job<Welcome>) -> eyre::Result<()> {
//!         tracing::info!(user_id = %job.data.user_id, "sending welcome");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = JobBroker::new("redis://127.0.0.1:6379");
//! let queue = broker.queue::<Welcome>("welcome").await?;
//! queue.enqueue(Welcome { user_id: "u1".into() }, JobOptions::default()).await?;
//! broker.start_worker("welcome", WelcomeHandler, WorkerOptions::default()).await;
//! broker.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
mod job;
mod queue;
mod queue_registry;
mod shutdown;
mod worker;
mod worker_registry;

pub use connection::BrokerConnection;
pub use error::BrokerError;
pub use job::{BackoffKind, BackoffPolicy, Job, JobEnvelope, JobOptions, QueuePolicy};
pub use queue::{EnqueuedJob, Queue, QueueControl};
pub use queue_registry::QueueRegistry;
pub use shutdown::JobBroker;
pub use worker::{JobHandler, WorkerOptions};
pub use worker_registry::WorkerRegistry;
