//! Consumer-group worker loop.
//!
//! A worker reads batches from its queue's stream through a consumer
//! group, runs the handler with bounded concurrency, and drives the retry
//! state machine: acknowledged on success, re-enqueued with backoff while
//! attempts remain, parked in the failed list once they run out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::BrokerConnection;
use crate::error::BrokerError;
use crate::job::{
    CONSUMER_GROUP, Job, JobEnvelope, QueuePolicy, completed_key, dedup_key, failed_key,
    stream_key,
};

/// Handler for jobs of payload type `T`.
///
/// `handle` does the work; the lifecycle hooks default to no-ops.
/// `on_failed` fires on every failed attempt, not only the terminal one.
#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, job: &Job<T>) -> eyre::Result<()>;

    async fn on_completed(&self, _job: &Job<T>) {}

    async fn on_failed(&self, _job: &Job<T>, _error: &eyre::Report) {}

    fn name(&self) -> &str {
        "worker"
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Registry name; defaults to the queue name
    pub name: Option<String>,
    /// Jobs processed simultaneously by this worker
    pub concurrency: usize,
    /// Entries fetched per read
    pub batch_size: usize,
    /// How long a read blocks waiting for work
    pub block_timeout: Duration,
    /// Retry and retention defaults for jobs whose envelope left them unset
    pub policy: QueuePolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: None,
            concurrency: 1,
            batch_size: 16,
            block_timeout: Duration::from_secs(1),
            policy: QueuePolicy::default(),
        }
    }
}

impl WorkerOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: QueuePolicy) -> Self {
        self.policy = policy;
        self
    }
}

type StreamReply = Option<Vec<(String, Vec<(String, Vec<(String, String)>)>)>>;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

pub(crate) struct Worker<T, H> {
    queue_name: String,
    connection: BrokerConnection,
    handler: Arc<H>,
    options: WorkerOptions,
    consumer_id: String,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T, H> Worker<T, H>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<T> + 'static,
{
    pub(crate) fn new(
        queue_name: impl Into<String>,
        connection: BrokerConnection,
        handler: Arc<H>,
        options: WorkerOptions,
    ) -> Self {
        let queue_name = queue_name.into();
        let consumer_id = format!("{queue_name}-{}", Uuid::new_v4());
        Self {
            queue_name,
            connection,
            handler,
            options,
            consumer_id,
            _payload: std::marker::PhantomData,
        }
    }

    /// Runs until the shutdown signal flips to true. In-flight jobs are
    /// awaited before returning, so a stopped worker never abandons work
    /// mid-handler.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue_name,
            consumer = %self.consumer_id,
            concurrency = self.options.concurrency,
            "worker started"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.fetch_batch(&mut shutdown).await {
                Ok(None) => break,
                Ok(Some(batch)) => {
                    consecutive_errors = 0;
                    self.dispatch(batch, &semaphore, &mut tasks).await;
                }
                Err(err) => {
                    consecutive_errors += 1;
                    let backoff = Duration::from_millis(
                        100u64.saturating_mul(1 << consecutive_errors.min(8)),
                    )
                    .min(MAX_ERROR_BACKOFF);
                    error!(
                        queue = %self.queue_name,
                        error = %err,
                        backoff = ?backoff,
                        "worker read failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }

            // Reap finished tasks without blocking.
            while tasks.try_join_next().is_some() {}
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                warn!(queue = %self.queue_name, error = %err, "job task panicked");
            }
        }
        info!(queue = %self.queue_name, consumer = %self.consumer_id, "worker stopped");
    }

    /// One blocking read from the consumer group. Returns `None` when the
    /// shutdown signal fired while waiting.
    async fn fetch_batch(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<(String, String)>>, BrokerError> {
        let mut conn = self.connection.acquire().await?;
        let stream = stream_key(&self.queue_name);

        let mut read_cmd = redis::cmd("XREADGROUP");
        read_cmd
            .arg("GROUP")
            .arg(CONSUMER_GROUP)
            .arg(&self.consumer_id)
            .arg("BLOCK")
            .arg(self.options.block_timeout.as_millis() as u64)
            .arg("COUNT")
            .arg(self.options.batch_size)
            .arg("STREAMS")
            .arg(&stream)
            .arg(">");
        let read = read_cmd.query_async::<StreamReply>(&mut conn);

        let reply = tokio::select! {
            reply = read => reply,
            _ = shutdown.changed() => return Ok(None),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) if err.to_string().contains("NOGROUP") => {
                self.ensure_group(&mut conn).await?;
                return Ok(Some(Vec::new()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        if let Some(streams) = reply {
            for (_, stream_entries) in streams {
                for (entry_id, fields) in stream_entries {
                    if let Some((_, raw)) = fields.into_iter().find(|(key, _)| key == "job") {
                        entries.push((entry_id, raw));
                    } else {
                        warn!(queue = %self.queue_name, entry = %entry_id, "entry without job field");
                        let _: Result<i64, _> = conn.xack(&stream, CONSUMER_GROUP, &[&entry_id]).await;
                    }
                }
            }
        }
        Ok(Some(entries))
    }

    pub(crate) async fn ensure_group(
        &self,
        conn: &mut redis::aio::ConnectionManager,
    ) -> Result<(), BrokerError> {
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key(&self.queue_name))
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;
        match result {
            Ok(_) => {
                debug!(queue = %self.queue_name, group = CONSUMER_GROUP, "consumer group created");
                Ok(())
            }
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Decodes a fetched batch, orders it by priority, and hands each job
    /// to a task gated by the concurrency semaphore. Undecodable entries
    /// are parked as failed immediately.
    async fn dispatch(
        &self,
        batch: Vec<(String, String)>,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) {
        let mut jobs: Vec<Job<T>> = Vec::with_capacity(batch.len());
        for (entry_id, raw) in batch {
            match JobEnvelope::<T>::from_json(&raw) {
                Ok(envelope) => jobs.push(Job::from_envelope(entry_id, envelope)),
                Err(err) => {
                    warn!(
                        queue = %self.queue_name,
                        entry = %entry_id,
                        error = %err,
                        "malformed job envelope, parking as failed"
                    );
                    self.park_raw(&entry_id, &raw).await;
                }
            }
        }

        // Lower priority value runs first; the sort is stable so equal
        // priorities keep broker order.
        jobs.sort_by_key(|job| job.opts.priority.unwrap_or(0));

        for job in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let runner = JobRunner {
                queue_name: self.queue_name.clone(),
                connection: self.connection.clone(),
                handler: self.handler.clone(),
                policy: self.options.policy.clone(),
                _payload: std::marker::PhantomData,
            };
            tasks.spawn(async move {
                runner.process(job).await;
                drop(permit);
            });
        }
    }

    async fn park_raw(&self, entry_id: &str, raw: &str) {
        let Ok(mut conn) = self.connection.acquire().await else {
            return;
        };
        let stream = stream_key(&self.queue_name);
        let failed = failed_key(&self.queue_name);
        let mut pipe = redis::pipe();
        pipe.cmd("LPUSH").arg(&failed).arg(raw).ignore();
        pipe.cmd("LTRIM")
            .arg(&failed)
            .arg(0)
            .arg(self.options.policy.keep_failed as isize - 1)
            .ignore();
        pipe.cmd("XACK")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg(entry_id)
            .ignore();
        if let Err(err) = pipe.query_async::<()>(&mut conn).await {
            error!(queue = %self.queue_name, entry = entry_id, error = %err, "failed to park entry");
        }
    }
}

/// Per-job state shared into the processing task.
struct JobRunner<T, H> {
    queue_name: String,
    connection: BrokerConnection,
    handler: Arc<H>,
    policy: QueuePolicy,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T, H> JobRunner<T, H>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: JobHandler<T>,
{
    async fn process(&self, job: Job<T>) {
        // Honor the envelope's delay: a delivery fetched early waits out
        // the remainder before the handler runs.
        let now = Utc::now();
        let runnable_at = job.runnable_at();
        if runnable_at > now {
            let wait = (runnable_at - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            debug!(queue = %self.queue_name, job_id = %job.job_id, wait = ?wait, "delaying job");
            tokio::time::sleep(wait).await;
        }

        debug!(
            queue = %self.queue_name,
            job_id = %job.job_id,
            attempt = job.attempts_made + 1,
            "processing job"
        );

        match self.handler.handle(&job).await {
            Ok(()) => {
                if let Err(err) = self.complete(&job).await {
                    error!(queue = %self.queue_name, job_id = %job.job_id, error = %err, "failed to record completion");
                }
                self.handler.on_completed(&job).await;
            }
            Err(report) => {
                self.handler.on_failed(&job, &report).await;
                if let Err(err) = self.fail(&job, &report).await {
                    error!(queue = %self.queue_name, job_id = %job.job_id, error = %err, "failed to record failure");
                }
            }
        }
    }

    async fn complete(&self, job: &Job<T>) -> Result<(), BrokerError> {
        let mut conn = self.connection.acquire().await?;
        let stream = stream_key(&self.queue_name);
        let completed = completed_key(&self.queue_name);

        let envelope = self.envelope_of(job, job.attempts_made + 1)?;
        let mut pipe = redis::pipe();
        pipe.cmd("XACK")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg(&job.id)
            .ignore();
        pipe.cmd("LPUSH").arg(&completed).arg(envelope).ignore();
        pipe.cmd("LTRIM")
            .arg(&completed)
            .arg(0)
            .arg(self.policy.keep_completed as isize - 1)
            .ignore();
        if job.opts.job_id.is_some() {
            pipe.cmd("DEL")
                .arg(dedup_key(&self.queue_name, &job.job_id))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        info!(queue = %self.queue_name, job_id = %job.job_id, "job completed");
        Ok(())
    }

    async fn fail(&self, job: &Job<T>, report: &eyre::Report) -> Result<(), BrokerError> {
        let attempts_made = job.attempts_made + 1;
        let max_attempts = job.opts.attempts.unwrap_or(self.policy.attempts);

        if attempts_made < max_attempts {
            self.requeue(job, attempts_made, report).await
        } else {
            self.park(job, attempts_made, report).await
        }
    }

    /// Puts a fresh delivery of the job back on the stream with the
    /// backoff delay for the next attempt, then acknowledges the old one.
    async fn requeue(
        &self,
        job: &Job<T>,
        attempts_made: u32,
        report: &eyre::Report,
    ) -> Result<(), BrokerError> {
        let mut conn = self.connection.acquire().await?;
        let stream = stream_key(&self.queue_name);

        let backoff = job
            .opts
            .backoff
            .clone()
            .unwrap_or_else(|| self.policy.backoff.clone());
        let delay = backoff.delay_for(attempts_made);

        let mut opts = job.opts.clone();
        opts.delay = Some(delay);
        let envelope = JobEnvelope {
            id: job.job_id.clone(),
            queue_name: job.queue_name.clone(),
            data: serde_json::to_value(&job.data).map_err(BrokerError::Serialization)?,
            opts,
            attempts_made,
            enqueued_at: Utc::now(),
        };
        let payload = envelope.to_json()?;

        let mut pipe = redis::pipe();
        pipe.cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .ignore();
        pipe.cmd("XACK")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg(&job.id)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;

        warn!(
            queue = %self.queue_name,
            job_id = %job.job_id,
            attempt = attempts_made,
            max_attempts = job.opts.attempts.unwrap_or(self.policy.attempts),
            retry_in_ms = delay,
            error = %report,
            "job failed, retrying"
        );
        Ok(())
    }

    /// Terminal failure: record in the failed list, acknowledge, and free
    /// the dedup guard so the job id can be enqueued again.
    async fn park(
        &self,
        job: &Job<T>,
        attempts_made: u32,
        report: &eyre::Report,
    ) -> Result<(), BrokerError> {
        let mut conn = self.connection.acquire().await?;
        let stream = stream_key(&self.queue_name);
        let failed = failed_key(&self.queue_name);

        let envelope = self.envelope_of(job, attempts_made)?;
        let mut pipe = redis::pipe();
        pipe.cmd("LPUSH").arg(&failed).arg(envelope).ignore();
        pipe.cmd("LTRIM")
            .arg(&failed)
            .arg(0)
            .arg(self.policy.keep_failed as isize - 1)
            .ignore();
        pipe.cmd("XACK")
            .arg(&stream)
            .arg(CONSUMER_GROUP)
            .arg(&job.id)
            .ignore();
        if job.opts.job_id.is_some() {
            pipe.cmd("DEL")
                .arg(dedup_key(&self.queue_name, &job.job_id))
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;

        error!(
            queue = %self.queue_name,
            job_id = %job.job_id,
            attempts = attempts_made,
            error = %report,
            "job failed permanently"
        );
        Ok(())
    }

    fn envelope_of(&self, job: &Job<T>, attempts_made: u32) -> Result<String, BrokerError> {
        let envelope = JobEnvelope {
            id: job.job_id.clone(),
            queue_name: job.queue_name.clone(),
            data: serde_json::to_value(&job.data).map_err(BrokerError::Serialization)?,
            opts: job.opts.clone(),
            attempts_made,
            enqueued_at: job.enqueued_at,
        };
        envelope.to_json().map_err(BrokerError::Serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_clamp_concurrency_and_batch() {
        let opts = WorkerOptions::default()
            .with_concurrency(0)
            .with_batch_size(0);
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.batch_size, 1);
    }

    #[test]
    fn default_options() {
        let opts = WorkerOptions::default();
        assert_eq!(opts.concurrency, 1);
        assert_eq!(opts.batch_size, 16);
        assert_eq!(opts.block_timeout, Duration::from_secs(1));
        assert!(opts.name.is_none());
    }
}
