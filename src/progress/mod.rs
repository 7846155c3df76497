//! Ordered, multi-subscriber progress streaming.
//!
//! The bus assigns each job a strictly increasing `seq`, persists every event
//! to the relational store (append-only, idempotent on `(job_id, seq)`),
//! mirrors it to the cache topic `job:{job_id}`, and fans it out to attached
//! subscribers over a broadcast channel.
//!
//! Subscribers replay the durable log from `from_seq`, then switch to live
//! events, deduplicating on `seq`; a broadcast lag or observed gap triggers a
//! re-read of the durable log, so delivery is at-least-once with no gaps at
//! the `seq` level. Streams close after delivering a terminal event.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{ProgressEvent, Stage};
use crate::stores::{Cache, RelationalStore};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

struct JobChannel {
    next_seq: u64,
    last_percent: u8,
    sender: Option<broadcast::Sender<ProgressEvent>>,
}

impl JobChannel {
    fn new(capacity: usize) -> Self {
        Self {
            next_seq: 0,
            last_percent: 0,
            sender: Some(broadcast::channel(capacity).0),
        }
    }

    fn is_closed(&self) -> bool {
        self.sender.is_none()
    }
}

/// Per-job ordered event stream with durable storage and cache fan-out.
pub struct ProgressBus {
    relational: Arc<dyn RelationalStore>,
    cache: Arc<dyn Cache>,
    jobs: Mutex<FxHashMap<Uuid, JobChannel>>,
    capacity: usize,
}

impl ProgressBus {
    pub fn new(relational: Arc<dyn RelationalStore>, cache: Arc<dyn Cache>) -> Self {
        Self::with_capacity(relational, cache, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        relational: Arc<dyn RelationalStore>,
        cache: Arc<dyn Cache>,
        capacity: usize,
    ) -> Self {
        Self {
            relational,
            cache,
            jobs: Mutex::new(FxHashMap::default()),
            capacity: capacity.max(1),
        }
    }

    /// Emit one event for `job_id`.
    ///
    /// Returns the stamped event, or `None` when the job already delivered a
    /// terminal event (late emissions are dropped so nothing ever follows a
    /// terminal event). Percent is forced monotone; terminal failure events
    /// freeze it at the last completed value.
    pub async fn emit(
        &self,
        job_id: Uuid,
        stage: Stage,
        percent: u8,
        message: impl Into<String>,
        counters: Option<Value>,
    ) -> Result<Option<ProgressEvent>, EngineError> {
        let (event, sender) = {
            let mut jobs = self.jobs.lock();
            let channel = jobs
                .entry(job_id)
                .or_insert_with(|| JobChannel::new(self.capacity));
            if channel.is_closed() {
                warn!(
                    target: "citeweave::progress",
                    %job_id,
                    stage = %stage,
                    "event after terminal; dropping"
                );
                return Ok(None);
            }

            let percent = match stage {
                // Failure terminals freeze percent at the last completed stage.
                Stage::Error | Stage::Cancelled => channel.last_percent,
                _ => percent.clamp(0, 100).max(channel.last_percent),
            };
            let event = ProgressEvent {
                job_id,
                seq: channel.next_seq,
                emitted_at: Utc::now(),
                stage,
                percent,
                message: message.into(),
                counters,
            };
            channel.next_seq += 1;
            channel.last_percent = percent;

            let sender = if stage.is_terminal() {
                // Dropping the sender closes every live subscription once the
                // terminal event has been drained.
                channel.sender.take().expect("checked open above")
            } else {
                channel.sender.clone().expect("checked open above")
            };
            (event, sender)
        };

        // Durable log first, then fan-out: a subscriber that attaches between
        // the two reads the event from the log instead.
        self.relational.append_progress(&event).await?;

        if let Ok(payload) = serde_json::to_value(&event) {
            let _ = self
                .cache
                .publish(&format!("job:{job_id}"), payload)
                .await;
        }
        let _ = sender.send(event.clone());
        Ok(Some(event))
    }

    /// Subscribe to a job's events starting at `from_seq`.
    ///
    /// Replays the durable log, then delivers live events until a terminal
    /// event closes the stream.
    pub async fn subscribe(
        &self,
        job_id: Uuid,
        from_seq: u64,
    ) -> Result<ProgressStream, EngineError> {
        let receiver = {
            let mut jobs = self.jobs.lock();
            let channel = jobs
                .entry(job_id)
                .or_insert_with(|| JobChannel::new(self.capacity));
            channel.sender.as_ref().map(|sender| sender.subscribe())
        };
        let backlog: VecDeque<ProgressEvent> = self
            .relational
            .progress_since(job_id, from_seq)
            .await?
            .into();

        Ok(ProgressStream {
            job_id,
            relational: Arc::clone(&self.relational),
            backlog,
            receiver,
            next_expected: from_seq,
            done: false,
        })
    }

    /// The last `seq` assigned for a job, if any event was emitted.
    pub fn last_seq(&self, job_id: Uuid) -> Option<u64> {
        let jobs = self.jobs.lock();
        jobs.get(&job_id)
            .and_then(|c| c.next_seq.checked_sub(1))
    }
}

/// One subscriber's view of a job's event stream.
pub struct ProgressStream {
    job_id: Uuid,
    relational: Arc<dyn RelationalStore>,
    backlog: VecDeque<ProgressEvent>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    next_expected: u64,
    done: bool,
}

impl ProgressStream {
    /// Next event in `seq` order; `None` once a terminal event was delivered
    /// (or the producer vanished with no more durable events).
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.done {
                return None;
            }

            if let Some(event) = self.backlog.pop_front() {
                if event.seq < self.next_expected {
                    continue;
                }
                return Some(self.deliver(event));
            }

            let Some(receiver) = self.receiver.as_mut() else {
                // Channel closed: one final durable read catches the tail.
                if self.refill().await && !self.backlog.is_empty() {
                    continue;
                }
                self.done = true;
                return None;
            };

            match receiver.recv().await {
                Ok(event) => {
                    if event.seq < self.next_expected {
                        continue;
                    }
                    if event.seq > self.next_expected {
                        // Gap: an event raced past us. The durable log is
                        // complete up to anything broadcast, so re-read it.
                        self.refill().await;
                        continue;
                    }
                    return Some(self.deliver(event));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(
                        target: "citeweave::progress",
                        job_id = %self.job_id,
                        missed,
                        "subscriber lagged; recovering from durable log"
                    );
                    self.refill().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                }
            }
        }
    }

    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.next_expected = event.seq + 1;
        if event.is_terminal() {
            self.done = true;
            self.receiver = None;
        }
        event
    }

    async fn refill(&mut self) -> bool {
        match self
            .relational
            .progress_since(self.job_id, self.next_expected)
            .await
        {
            Ok(events) => {
                self.backlog = events.into();
                true
            }
            Err(err) => {
                warn!(
                    target: "citeweave::progress",
                    job_id = %self.job_id,
                    error = %err,
                    "durable refill failed"
                );
                false
            }
        }
    }

    /// Adapt into a plain `futures` stream for SSE-style consumers.
    pub fn into_stream(self) -> BoxStream<'static, ProgressEvent> {
        Box::pin(stream::unfold(self, |mut inner| async move {
            inner.next().await.map(|event| (event, inner))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemoryCache, MemoryRelationalStore};

    fn bus() -> ProgressBus {
        ProgressBus::new(
            Arc::new(MemoryRelationalStore::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    #[tokio::test]
    async fn seq_starts_at_zero_and_percent_is_monotone() {
        let bus = bus();
        let job = Uuid::new_v4();
        let first = bus
            .emit(job, Stage::Queued, 0, "queued", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.seq, 0);

        bus.emit(job, Stage::Extract, 15, "extracted", None)
            .await
            .unwrap();
        // A stage reporting a lower percent cannot move the needle backwards.
        let event = bus
            .emit(job, Stage::Chunk, 5, "chunked", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.seq, 2);
        assert_eq!(event.percent, 15);
    }

    #[tokio::test]
    async fn terminal_failure_freezes_percent() {
        let bus = bus();
        let job = Uuid::new_v4();
        bus.emit(job, Stage::Queued, 0, "queued", None).await.unwrap();
        bus.emit(job, Stage::Chunk, 25, "chunked", None).await.unwrap();
        let error = bus
            .emit(job, Stage::Error, 99, "boom", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.percent, 25);
    }

    #[tokio::test]
    async fn nothing_follows_a_terminal_event() {
        let bus = bus();
        let job = Uuid::new_v4();
        bus.emit(job, Stage::Queued, 0, "queued", None).await.unwrap();
        bus.emit(job, Stage::Complete, 100, "done", None)
            .await
            .unwrap();
        let late = bus
            .emit(job, Stage::Extract, 15, "late", None)
            .await
            .unwrap();
        assert!(late.is_none());
        assert_eq!(bus.last_seq(job), Some(1));
    }

    #[tokio::test]
    async fn subscribers_replay_then_follow_live_and_close_on_terminal() {
        let bus = Arc::new(bus());
        let job = Uuid::new_v4();
        bus.emit(job, Stage::Queued, 0, "queued", None).await.unwrap();
        bus.emit(job, Stage::Extract, 15, "extracted", None)
            .await
            .unwrap();

        let mut stream = bus.subscribe(job, 0).await.unwrap();
        assert_eq!(stream.next().await.unwrap().seq, 0);
        assert_eq!(stream.next().await.unwrap().seq, 1);

        let bus2 = Arc::clone(&bus);
        let live = tokio::spawn(async move {
            bus2.emit(job, Stage::Chunk, 25, "chunked", None)
                .await
                .unwrap();
            bus2.emit(job, Stage::Complete, 100, "done", None)
                .await
                .unwrap();
        });

        assert_eq!(stream.next().await.unwrap().seq, 2);
        let terminal = stream.next().await.unwrap();
        assert_eq!(terminal.stage, Stage::Complete);
        assert!(stream.next().await.is_none());
        live.await.unwrap();
    }

    #[tokio::test]
    async fn from_seq_skips_earlier_events_without_gaps_or_duplicates() {
        let bus = bus();
        let job = Uuid::new_v4();
        for (stage, pct) in [
            (Stage::Queued, 0),
            (Stage::Extract, 15),
            (Stage::Chunk, 25),
            (Stage::Complete, 100),
        ] {
            bus.emit(job, stage, pct, stage.as_str(), None).await.unwrap();
        }

        let mut stream = bus.subscribe(job, 2).await.unwrap();
        let mut seqs = Vec::new();
        while let Some(event) = stream.next().await {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn independent_subscribers_see_the_same_ordered_events() {
        let bus = Arc::new(bus());
        let job = Uuid::new_v4();
        let a = bus.subscribe(job, 0).await.unwrap();
        let b = bus.subscribe(job, 0).await.unwrap();

        let emitter = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.emit(job, Stage::Queued, 0, "queued", None).await.unwrap();
                bus.emit(job, Stage::Complete, 100, "done", None)
                    .await
                    .unwrap();
            })
        };

        let drain = |mut s: ProgressStream| async move {
            let mut seqs = Vec::new();
            while let Some(event) = s.next().await {
                seqs.push(event.seq);
            }
            seqs
        };
        let (seqs_a, seqs_b) = tokio::join!(drain(a), drain(b));
        assert_eq!(seqs_a, vec![0, 1]);
        assert_eq!(seqs_b, vec![0, 1]);
        emitter.await.unwrap();

        // Re-reading after the fact still works from the durable log.
        let mut c = bus.subscribe(job, 0).await.unwrap();
        assert_eq!(c.next().await.unwrap().seq, 0);
        assert_eq!(c.next().await.unwrap().stage, Stage::Complete);
        assert!(c.next().await.is_none());
    }

    #[tokio::test]
    async fn cache_topic_mirrors_events() {
        let relational = Arc::new(MemoryRelationalStore::new());
        let cache = Arc::new(MemoryCache::new());
        let bus = ProgressBus::new(relational, cache.clone());
        let job = Uuid::new_v4();

        let mut sub = cache.subscribe(&format!("job:{job}"));
        bus.emit(job, Stage::Queued, 0, "queued", None).await.unwrap();
        let message = sub.recv().await.unwrap();
        assert_eq!(message["seq"], 0);
        assert_eq!(message["stage"], "QUEUED");
    }
}
