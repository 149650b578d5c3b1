//! Typed producer side of a queue.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::BrokerConnection;
use crate::error::BrokerError;
use crate::job::{JobEnvelope, JobOptions, QueuePolicy, dedup_key, stream_key};

/// Outcome of an enqueue.
#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    /// Stable job identifier
    pub job_id: String,
    /// Broker stream entry id. For a deduplicated enqueue this is the
    /// surviving entry's id; `None` when the winner had not recorded its
    /// entry yet, or already reached a terminal state.
    pub broker_id: Option<String>,
    /// True when a job with the same id was already pending and this
    /// enqueue was dropped in its favor
    pub deduplicated: bool,
}

/// Producer handle for a named queue with payload type `T`.
///
/// All queues share the one broker connection; a `Queue` owns no socket
/// of its own. Closing flips a flag that fails later enqueues, it does
/// not tear down the connection.
#[derive(Debug)]
pub struct Queue<T> {
    name: String,
    connection: BrokerConnection,
    policy: QueuePolicy,
    closed: AtomicBool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(
        name: impl Into<String>,
        connection: BrokerConnection,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            policy,
            closed: AtomicBool::new(false),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Appends one job to the queue's stream.
    ///
    /// Queue defaults are baked into the stored envelope here, so workers
    /// see fully resolved options. When `opts.job_id` is set, the dedup
    /// guard is claimed before anything touches the stream: a duplicate
    /// enqueue is dropped without ever appending an entry, so a blocked
    /// worker cannot observe it.
    pub async fn enqueue(&self, data: T, opts: JobOptions) -> Result<EnqueuedJob, BrokerError> {
        self.ensure_open()?;
        let mut conn = self.connection.acquire().await?;

        let opts = self.policy.apply(opts);
        let supplied_id = opts.job_id.clone();
        let job_id = supplied_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let stream = stream_key(&self.name);

        if supplied_id.is_some() {
            let guard = dedup_key(&self.name, &job_id);
            if !claim_guard(&mut conn, &guard).await? {
                let winner = read_guard(&mut conn, &guard).await?;
                debug!(queue = %self.name, job_id = %job_id, "duplicate job dropped");
                return Ok(EnqueuedJob {
                    job_id,
                    broker_id: winner,
                    deduplicated: true,
                });
            }
        }

        let envelope = JobEnvelope {
            id: job_id.clone(),
            queue_name: self.name.clone(),
            data,
            opts,
            attempts_made: 0,
            enqueued_at: Utc::now(),
        };
        let payload = envelope.to_json()?;

        let broker_id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .query_async(&mut conn)
            .await?;

        if supplied_id.is_some() {
            let guard = dedup_key(&self.name, &job_id);
            record_guard(&mut conn, &guard, &broker_id).await?;
        }

        debug!(queue = %self.name, job_id = %job_id, broker_id = %broker_id, "job enqueued");
        Ok(EnqueuedJob {
            job_id,
            broker_id: Some(broker_id),
            deduplicated: false,
        })
    }

    /// Appends a batch of jobs, pipelining the stream appends.
    ///
    /// Dedup guards are claimed per job before the pipelined append, so a
    /// duplicate in (or racing with) the batch never reaches the stream,
    /// same as the single-enqueue path.
    pub async fn enqueue_many(
        &self,
        jobs: Vec<(T, JobOptions)>,
    ) -> Result<Vec<EnqueuedJob>, BrokerError> {
        self.ensure_open()?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.acquire().await?;
        let stream = stream_key(&self.name);

        enum Slot {
            Duplicate(EnqueuedJob),
            Appended { job_id: String, supplied: bool },
        }

        let mut slots = Vec::with_capacity(jobs.len());
        let mut pipe = redis::pipe();
        let mut appended_count = 0usize;
        for (data, opts) in jobs {
            let opts = self.policy.apply(opts);
            let supplied = opts.job_id.is_some();
            let job_id = opts
                .job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            if supplied {
                let guard = dedup_key(&self.name, &job_id);
                if !claim_guard(&mut conn, &guard).await? {
                    let winner = read_guard(&mut conn, &guard).await?;
                    debug!(queue = %self.name, job_id = %job_id, "duplicate job dropped");
                    slots.push(Slot::Duplicate(EnqueuedJob {
                        job_id,
                        broker_id: winner,
                        deduplicated: true,
                    }));
                    continue;
                }
            }

            let envelope = JobEnvelope {
                id: job_id.clone(),
                queue_name: self.name.clone(),
                data,
                opts,
                attempts_made: 0,
                enqueued_at: Utc::now(),
            };
            pipe.cmd("XADD")
                .arg(&stream)
                .arg("*")
                .arg("job")
                .arg(envelope.to_json()?);
            appended_count += 1;
            slots.push(Slot::Appended { job_id, supplied });
        }

        let broker_ids: Vec<String> = if appended_count > 0 {
            pipe.query_async(&mut conn).await?
        } else {
            Vec::new()
        };

        let mut broker_ids = broker_ids.into_iter();
        let mut guard_pipe = redis::pipe();
        let mut guards_to_record = 0usize;
        let mut results = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Duplicate(job) => results.push(job),
                Slot::Appended { job_id, supplied } => {
                    let broker_id = broker_ids
                        .next()
                        .ok_or(BrokerError::Internal("pipeline reply shorter than batch"))?;
                    if supplied {
                        guard_pipe
                            .cmd("SET")
                            .arg(dedup_key(&self.name, &job_id))
                            .arg(&broker_id)
                            .ignore();
                        guards_to_record += 1;
                    }
                    results.push(EnqueuedJob {
                        job_id,
                        broker_id: Some(broker_id),
                        deduplicated: false,
                    });
                }
            }
        }
        if guards_to_record > 0 {
            guard_pipe.query_async::<()>(&mut conn).await?;
        }

        debug!(queue = %self.name, count = results.len(), "batch enqueued");
        Ok(results)
    }

    /// Removes a not-yet-consumed job by its broker entry id.
    ///
    /// Returns true when an entry was actually deleted. The dedup guard,
    /// if the job carried one, is cleared so the id can be reused.
    pub async fn remove(&self, broker_id: &str) -> Result<bool, BrokerError> {
        self.ensure_open()?;
        let mut conn = self.connection.acquire().await?;
        let stream = stream_key(&self.name);

        type Entry = (String, Vec<(String, String)>);
        let entries: Vec<Entry> = redis::cmd("XRANGE")
            .arg(&stream)
            .arg(broker_id)
            .arg(broker_id)
            .query_async(&mut conn)
            .await?;

        if let Some((_, fields)) = entries.first() {
            if let Some((_, raw)) = fields.iter().find(|(key, _)| key == "job") {
                match JobEnvelope::<serde_json::Value>::from_json(raw) {
                    Ok(envelope) if envelope.opts.job_id.is_some() => {
                        let guard = dedup_key(&self.name, &envelope.id);
                        let _: i64 = redis::cmd("DEL")
                            .arg(&guard)
                            .query_async(&mut conn)
                            .await?;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(queue = %self.name, broker_id, error = %err, "unreadable envelope during remove");
                    }
                }
            }
        }

        let deleted: i64 = redis::cmd("XDEL")
            .arg(&stream)
            .arg(broker_id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    /// Marks the queue closed. Later enqueues fail with
    /// [`BrokerError::QueueClosed`]; jobs already on the stream are
    /// untouched and workers keep draining them.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.name, "queue closed");
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::QueueClosed {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Claims the dedup guard for a job id. The guard starts empty; the
/// winner records its stream entry id with [`record_guard`] once the
/// append lands. Returns false when another enqueue holds the guard.
async fn claim_guard(
    conn: &mut redis::aio::ConnectionManager,
    guard: &str,
) -> Result<bool, BrokerError> {
    let claimed: Option<String> = redis::cmd("SET")
        .arg(guard)
        .arg("")
        .arg("NX")
        .query_async(conn)
        .await?;
    Ok(claimed.is_some())
}

/// Reads the winning entry id off a held guard. Empty means the winner
/// has not recorded it yet; absent means the job already reached a
/// terminal state.
async fn read_guard(
    conn: &mut redis::aio::ConnectionManager,
    guard: &str,
) -> Result<Option<String>, BrokerError> {
    let value: Option<String> = redis::cmd("GET").arg(guard).query_async(conn).await?;
    Ok(value.filter(|v| !v.is_empty()))
}

async fn record_guard(
    conn: &mut redis::aio::ConnectionManager,
    guard: &str,
    broker_id: &str,
) -> Result<(), BrokerError> {
    let _: () = redis::cmd("SET")
        .arg(guard)
        .arg(broker_id)
        .query_async(conn)
        .await?;
    Ok(())
}

/// Type-erased view of a queue, used by the registry for shutdown.
#[async_trait]
pub trait QueueControl: Send + Sync {
    fn name(&self) -> &str;
    async fn close(&self);
}

#[async_trait]
impl<T> QueueControl for Queue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        Queue::name(self)
    }

    async fn close(&self) {
        Queue::close(self);
    }
}

// The wrapper lets the registry hold one Arc under both the typed and the
// type-erased view without a double allocation.
pub(crate) struct ErasedQueue<T>(pub Arc<Queue<T>>);

#[async_trait]
impl<T> QueueControl for ErasedQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn close(&self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue() -> Queue<u32> {
        Queue::new(
            "numbers",
            BrokerConnection::new("redis://127.0.0.1:1"),
            QueuePolicy::default(),
        )
    }

    #[tokio::test]
    async fn enqueue_on_closed_queue_fails_without_io() {
        let queue = test_queue();
        queue.close();
        let err = queue.enqueue(1, JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueClosed { name } if name == "numbers"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let queue = test_queue();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let queue = test_queue();
        let results = queue.enqueue_many(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }
}
