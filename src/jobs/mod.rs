//! Durable job management: priority queue, worker pool, retry, cancellation,
//! heartbeats.
//!
//! One job occupies one worker for its duration; stages inside a job run
//! sequentially. The `jobs` table is the durable source of truth; the
//! in-memory queue holds only ids and is rebuilt on recovery. Workers claim a
//! job by flipping its status from QUEUED, heartbeat by touching
//! `updated_at`, and a reaper returns silently-held jobs to the queue after
//! the heartbeat timeout without consuming an attempt (visibility-timeout
//! pattern).

pub mod maintenance;
pub mod queue;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, RetryDecision, retry_decision};
use crate::model::{Job, JobStatus, Stage};
use crate::pipeline::{IngestPipeline, StageContext, StageObserver};
use crate::progress::ProgressBus;
use crate::providers::{TieredEmbedder, TieredGenerator};
use crate::stores::StoreFacade;

pub use queue::JobQueue;

const STATUS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Owns the job lifecycle end to end.
pub struct JobManager {
    facade: StoreFacade,
    bus: Arc<ProgressBus>,
    pipeline: Arc<IngestPipeline>,
    embedder: TieredEmbedder,
    generator: TieredGenerator,
    config: EngineConfig,
    queue: Arc<JobQueue>,
    cancels: Mutex<FxHashMap<Uuid, watch::Sender<bool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    // Handle back to the owning Arc so start() can hand clones to workers.
    weak_self: Weak<Self>,
}

impl JobManager {
    pub fn new(
        facade: StoreFacade,
        pipeline: IngestPipeline,
        embedder: TieredEmbedder,
        generator: TieredGenerator,
        config: EngineConfig,
    ) -> Arc<Self> {
        let bus = Arc::new(ProgressBus::new(
            Arc::clone(&facade.relational),
            Arc::clone(&facade.cache),
        ));
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            facade,
            bus,
            pipeline: Arc::new(pipeline),
            embedder,
            generator,
            config,
            queue: Arc::new(JobQueue::new()),
            cancels: Mutex::new(FxHashMap::default()),
            workers: Mutex::new(Vec::new()),
            shutdown,
            weak_self: weak_self.clone(),
        })
    }

    /// The bus carrying this manager's progress events.
    pub fn bus(&self) -> Arc<ProgressBus> {
        Arc::clone(&self.bus)
    }

    /// Re-enqueue durable QUEUED/RETRYING jobs, then start the worker pool
    /// and the heartbeat reaper.
    pub async fn start(&self) -> Result<(), EngineError> {
        let Some(this) = self.weak_self.upgrade() else {
            return Ok(());
        };
        self.recover().await?;
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        for index in 0..self.config.worker_concurrency {
            let manager = Arc::clone(&this);
            workers.push(tokio::spawn(async move {
                manager.worker_loop(index).await;
            }));
        }
        let manager = this;
        workers.push(tokio::spawn(async move {
            manager.reaper_loop().await;
        }));
        Ok(())
    }

    /// Signal shutdown and abort the pool.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }

    /// Persist a new job, emit its `QUEUED` event at `seq = 0`, and enqueue.
    pub async fn submit(&self, url: &str, priority: u8) -> Result<Uuid, EngineError> {
        let job = Job::new(url, priority, self.config.max_automatic_retries);
        self.persist(&job).await?;
        self.bus
            .emit(job.job_id, Stage::Queued, 0, "queued", None)
            .await?;
        self.queue.push(job.job_id, job.priority);
        info!(
            target: "citeweave::jobs",
            job_id = %job.job_id,
            url,
            priority = job.priority,
            "job submitted"
        );
        Ok(job.job_id)
    }

    /// Cache-first job lookup (TTL 60 s), falling back to the relational
    /// store.
    pub async fn status(&self, job_id: Uuid) -> Result<Option<Job>, EngineError> {
        let key = status_cache_key(job_id);
        if let Some(cached) = self.facade.cache.get_json(&key).await? {
            if let Ok(job) = serde_json::from_value::<Job>(cached) {
                return Ok(Some(job));
            }
        }
        let job = self.facade.relational.job(job_id).await?;
        if let Some(job) = &job {
            if let Ok(value) = serde_json::to_value(job) {
                let _ = self
                    .facade
                    .cache
                    .put_json(&key, value, STATUS_CACHE_TTL)
                    .await;
            }
        }
        Ok(job)
    }

    /// Cancel a job. A running worker observes the token at the next stage
    /// boundary; indexer work already committed stays (idempotent upserts).
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, EngineError> {
        let Some(mut job) = self.facade.relational.job(job_id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.transition(JobStatus::Cancelled);
        self.persist(&job).await?;
        if let Some(token) = self.cancels.lock().get(&job_id) {
            let _ = token.send(true);
        }
        self.bus
            .emit(job_id, Stage::Cancelled, 0, "cancelled on request", None)
            .await?;
        Ok(true)
    }

    /// Re-enqueue a FAILED job. Manual retries raise the attempt ceiling and
    /// boost priority by two bands.
    pub async fn retry(&self, job_id: Uuid, manual: bool) -> Result<bool, EngineError> {
        let Some(mut job) = self.facade.relational.job(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }
        let limit = if manual {
            self.config.max_manual_retries
        } else {
            self.config.max_automatic_retries
        };
        if job.attempt_count >= limit {
            return Ok(false);
        }
        if manual {
            job.priority = job.priority.saturating_sub(2).max(1);
        }
        job.max_attempts = job.max_attempts.max(limit);
        job.transition(JobStatus::Retrying);
        self.persist(&job).await?;
        self.schedule_requeue(job.job_id, job.priority, job.attempt_count);
        Ok(true)
    }

    async fn recover(&self) -> Result<(), EngineError> {
        for status in [JobStatus::Queued, JobStatus::Retrying] {
            for mut job in self.facade.relational.jobs_with_status(status).await? {
                if status == JobStatus::Retrying {
                    job.transition(JobStatus::Queued);
                    self.persist(&job).await?;
                }
                self.queue.push(job.job_id, job.priority);
            }
        }
        Ok(())
    }

    async fn persist(&self, job: &Job) -> Result<(), EngineError> {
        self.facade.relational.upsert_job(job).await?;
        let _ = self
            .facade
            .cache
            .invalidate(&status_cache_key(job.job_id))
            .await;
        Ok(())
    }

    fn schedule_requeue(&self, job_id: Uuid, priority: u8, attempt_count: u32) {
        let backoff_units = 2u64.saturating_pow(attempt_count.min(16)).min(300);
        let jitter_ms = rand::rng().random_range(0..250);
        let delay = self.config.backoff_unit * backoff_units as u32
            + Duration::from_millis(jitter_ms);
        let relational = Arc::clone(&self.facade.relational);
        let cache = Arc::clone(&self.facade.cache);
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match relational.job(job_id).await {
                Ok(Some(mut job)) if job.status == JobStatus::Retrying => {
                    job.transition(JobStatus::Queued);
                    if relational.upsert_job(&job).await.is_ok() {
                        let _ = cache.invalidate(&status_cache_key(job_id)).await;
                        queue.push(job_id, priority);
                    }
                }
                // Cancelled (or vanished) while waiting out the backoff.
                _ => {}
            }
        });
    }

    async fn worker_loop(self: Arc<Self>, index: usize) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let job_id = tokio::select! {
                _ = shutdown.changed() => break,
                job_id = self.queue.pop_wait() => job_id,
            };
            if let Err(err) = self.process(job_id).await {
                error!(
                    target: "citeweave::jobs",
                    worker = index,
                    %job_id,
                    error = %err,
                    "worker failed to process job"
                );
            }
        }
    }

    async fn process(&self, job_id: Uuid) -> Result<(), EngineError> {
        let Some(mut job) = self.facade.relational.job(job_id).await? else {
            return Ok(());
        };
        if job.status != JobStatus::Queued {
            // Cancelled while queued, or already claimed.
            return Ok(());
        }

        // Claim: one more attempt begins.
        job.attempt_count += 1;
        job.transition(JobStatus::Extracting);
        self.persist(&job).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.lock().insert(job_id, cancel_tx);
        let heartbeat = self.spawn_heartbeat(job_id);

        let cx = StageContext::new(
            self.facade.clone(),
            self.embedder.clone(),
            self.generator.clone(),
            self.config.clone(),
            cancel_rx,
        );
        let result = self
            .pipeline
            .run(job_id, &job.url, &cx, &self.bus, Some(self as &dyn StageObserver))
            .await;

        heartbeat.abort();
        self.cancels.lock().remove(&job_id);

        let mut job = self.facade.relational.job(job_id).await?.unwrap_or(job);
        match result {
            Ok(report) => {
                if job.status == JobStatus::Cancelled {
                    // Raced with cancellation on the final boundary; the
                    // terminal event was already emitted.
                    return Ok(());
                }
                job.result_doc_id = Some(report.doc_id.clone());
                job.last_error = None;
                job.transition(JobStatus::Completed);
                self.persist(&job).await?;
                self.bus
                    .emit(
                        job_id,
                        Stage::Complete,
                        100,
                        "ingestion complete",
                        Some(json!({
                            "doc_id": report.doc_id,
                            "chunks": report.chunk_count,
                            "mentions": report.mention_count,
                            "entities": report.entity_count,
                            "relations": report.relation_count,
                        })),
                    )
                    .await?;
            }
            Err(err) => self.handle_failure(job, err).await?,
        }
        Ok(())
    }

    async fn handle_failure(&self, mut job: Job, err: EngineError) -> Result<(), EngineError> {
        let kind = err.kind();
        job.last_error = Some(err.to_string());
        match retry_decision(kind, job.attempt_count, job.max_attempts) {
            RetryDecision::Retry { .. } => {
                warn!(
                    target: "citeweave::jobs",
                    job_id = %job.job_id,
                    attempt = job.attempt_count,
                    error = %err,
                    "transient failure; scheduling retry"
                );
                job.transition(JobStatus::Retrying);
                self.persist(&job).await?;
                self.schedule_requeue(job.job_id, job.priority, job.attempt_count);
            }
            RetryDecision::Fail => {
                job.transition(JobStatus::Failed);
                self.persist(&job).await?;
                let message = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "ingestion failed".to_string());
                self.bus
                    .emit(job.job_id, Stage::Error, 0, message, None)
                    .await?;
            }
            RetryDecision::Cancel => {
                if job.status != JobStatus::Cancelled {
                    job.transition(JobStatus::Cancelled);
                    self.persist(&job).await?;
                }
                // No-op if cancel() already delivered the terminal event.
                self.bus
                    .emit(job.job_id, Stage::Cancelled, 0, "cancelled", None)
                    .await?;
            }
        }
        Ok(())
    }

    fn spawn_heartbeat(&self, job_id: Uuid) -> JoinHandle<()> {
        let relational = Arc::clone(&self.facade.relational);
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match relational.job(job_id).await {
                    Ok(Some(mut job)) if job.status.is_running() => {
                        let status = job.status;
                        job.transition(status);
                        let _ = relational.upsert_job(&job).await;
                    }
                    _ => break,
                }
            }
        })
    }

    async fn reaper_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let period = (self.config.heartbeat_timeout / 2).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let Ok(running) = self.facade.relational.running_jobs().await else {
                continue;
            };
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(self.config.heartbeat_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
            for mut job in running {
                if self.cancels.lock().contains_key(&job.job_id) {
                    continue;
                }
                if job.updated_at < cutoff {
                    warn!(
                        target: "citeweave::jobs",
                        job_id = %job.job_id,
                        "heartbeat timed out; returning job to the queue"
                    );
                    // The attempt is not consumed by a silent worker.
                    job.transition(JobStatus::Queued);
                    if self.persist(&job).await.is_ok() {
                        self.queue.push(job.job_id, job.priority);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StageObserver for JobManager {
    async fn on_stage_start(&self, job_id: Uuid, stage: Stage) {
        let status = match stage {
            Stage::Extract => JobStatus::Extracting,
            Stage::Index => JobStatus::Loading,
            _ => JobStatus::Transforming,
        };
        if let Ok(Some(mut job)) = self.facade.relational.job(job_id).await {
            if !job.status.is_terminal() && job.status != status {
                job.transition(status);
                let _ = self.persist(&job).await;
            }
        }
    }
}

fn status_cache_key(job_id: Uuid) -> String {
    format!("job:{job_id}:record")
}
