//! Bounded intake queue in front of the aggregation pipeline.
//!
//! Producers call `send`, which waits while the queue is full. A flush is triggered when
//! the queue fills up and on every tick of the flush timer. Each flush drains whatever is
//! queued at that moment, so a size-triggered and a timer-triggered flush may run at the
//! same time without coordination: they never see the same event.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time;

use eventsum_common::health::HealthHandle;
use eventsum_common::metrics::{BATCH_SIZE, EVENTS_RECEIVED, FLUSHES, QUEUE_DEPTH};
use eventsum_common::model::RawEvent;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::error::WorkerError;
use crate::persister::{PersistReport, Persister};

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Size,
    Timer,
    Shutdown,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Size => "size",
            Trigger::Timer => "timer",
            Trigger::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    sender: mpsc::Sender<RawEvent>,
    receiver: Mutex<mpsc::Receiver<RawEvent>>,
    capacity: usize,
    flush_interval: time::Duration,
    aggregator: Aggregator,
    persister: Persister,
    cancel: CancellationToken,
    started: AtomicBool,
    /// Size-triggered flushes still running.
    flushes: TaskTracker,
    drained: AtomicUsize,
}

/// Handle to the intake queue. Clones share the same queue.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    /// `capacity` is both the queue size and the number of queued events that triggers a
    /// flush. It must not be zero.
    pub fn new(
        capacity: usize,
        flush_interval: time::Duration,
        aggregator: Aggregator,
        persister: Persister,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);

        Self {
            inner: Arc::new(Inner {
                sender,
                receiver: Mutex::new(receiver),
                capacity,
                flush_interval,
                aggregator,
                persister,
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                flushes: TaskTracker::new(),
                drained: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of events currently queued.
    pub fn queued(&self) -> usize {
        self.inner.capacity - self.inner.sender.capacity()
    }

    /// Total number of events drained by flushes so far.
    pub fn drained(&self) -> usize {
        self.inner.drained.load(Ordering::SeqCst)
    }

    /// Queue an event, waiting for room if the queue is full. Filling the queue starts a
    /// flush in the background. Fails with `Stopped` once `stop` was called, including
    /// for a send still waiting for room at that point.
    pub async fn send(&self, event: RawEvent) -> Result<(), WorkerError> {
        let permit = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return Err(WorkerError::Stopped),
            permit = self.inner.sender.reserve() => permit.map_err(|_| WorkerError::Stopped)?,
        };
        permit.send(event);

        metrics::counter!(EVENTS_RECEIVED).increment(1);

        if self.inner.cancel.is_cancelled() {
            // Stopped while this event was being queued: the shutdown flush may have
            // drained the queue already.
            self.flush(Trigger::Shutdown).await;
            return Ok(());
        }

        let queued = self.queued();
        metrics::gauge!(QUEUE_DEPTH).set(queued as f64);

        if queued >= self.inner.capacity {
            let batcher = self.clone();
            self.inner.flushes.spawn(async move {
                batcher.flush(Trigger::Size).await;
            });
        }

        Ok(())
    }

    /// Drain every queued event and run it through aggregation and persistence.
    /// Returns `None` when there was nothing to drain.
    pub async fn flush(&self, trigger: Trigger) -> Option<PersistReport> {
        let events = {
            let mut receiver = self.inner.receiver.lock().await;
            let mut events = Vec::with_capacity(self.inner.capacity);
            while let Ok(event) = receiver.try_recv() {
                events.push(event);
            }
            events
        };

        if events.is_empty() {
            return None;
        }
        self.inner.drained.fetch_add(events.len(), Ordering::SeqCst);

        metrics::counter!(FLUSHES, "trigger" => trigger.as_str()).increment(1);
        metrics::histogram!(BATCH_SIZE).record(events.len() as f64);
        metrics::gauge!(QUEUE_DEPTH).set(self.queued() as f64);
        debug!(%trigger, events = events.len(), "flushing batch");

        let batch = self.inner.aggregator.aggregate(&events);
        if batch.is_empty() {
            return Some(PersistReport::default());
        }

        Some(self.inner.persister.persist(batch).await)
    }

    /// Start the flush timer. Can only be called once. The returned task finishes after
    /// `stop` was called, the queue was drained one last time and every running flush
    /// completed.
    pub fn start(&self, liveness: Option<HealthHandle>) -> Result<JoinHandle<()>, WorkerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyStarted);
        }

        let batcher = self.clone();
        Ok(tokio::spawn(async move { batcher.run(liveness).await }))
    }

    async fn run(&self, liveness: Option<HealthHandle>) {
        let mut interval = tokio::time::interval(self.inner.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        info!(
            capacity = self.inner.capacity,
            flush_interval = ?self.inner.flush_interval,
            "batcher started"
        );

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(liveness) = &liveness {
                        liveness.report_healthy();
                    }
                    self.flush(Trigger::Timer).await;
                }
            }
        }

        self.flush(Trigger::Shutdown).await;
        self.inner.flushes.close();
        self.inner.flushes.wait().await;
        info!("batcher stopped");
    }

    /// Stop the flush timer. Queued events are flushed once more before the task returned
    /// by `start` finishes; later calls to `send` fail.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }
}
