//! Adaptive outbound batching.
//!
//! Messages are buffered per batch key and released as one batch when the
//! configured [`BatchStrategy`] says so. The flush decision is a pure
//! function of the pending list, the config and the current load; the
//! engine only adds the per-key locking that makes flush-and-clear atomic
//! with respect to concurrent appends.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use lifeline_core::{ConnectionId, EngineError, Result};
use lifeline_settings::{BatchConfig, BatchStrategy};
use lifeline_telemetry::{MetricsCollector, Tags, names};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;
use crate::transport::Frame;

// ─────────────────────────────────────────────────────────────────────────────
// Flush decision
// ─────────────────────────────────────────────────────────────────────────────

/// One buffered outbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage<T> {
    /// Message body.
    pub payload: T,
    /// When it was enqueued.
    pub enqueued_at: Instant,
    /// Higher is more urgent.
    pub priority: i32,
}

impl<T> PendingMessage<T> {
    /// Message enqueued now.
    pub fn new(payload: T, priority: i32) -> Self {
        Self::at(payload, priority, Instant::now())
    }

    /// Message enqueued at a given instant.
    pub fn at(payload: T, priority: i32, enqueued_at: Instant) -> Self {
        Self {
            payload,
            enqueued_at,
            priority,
        }
    }
}

/// Size threshold of the adaptive strategy at `load` (0.0 to 1.0).
pub fn adaptive_threshold(config: &BatchConfig, load: f64) -> usize {
    if load > 0.8 {
        config.adaptive_max_batch
    } else if load > 0.5 {
        config.adaptive_min_batch
            + config
                .adaptive_max_batch
                .saturating_sub(config.adaptive_min_batch)
                / 2
    } else {
        config.adaptive_min_batch
    }
}

/// Whether `pending` should be flushed now.
pub fn should_flush<T>(
    config: &BatchConfig,
    load: f64,
    pending: &[PendingMessage<T>],
    now: Instant,
) -> bool {
    if pending.is_empty() {
        return false;
    }
    let len = pending.len();
    let waited_long_enough = || {
        pending
            .iter()
            .map(|m| m.enqueued_at)
            .min()
            .is_some_and(|oldest| now.saturating_duration_since(oldest) >= config.max_wait())
    };

    match config.strategy {
        BatchStrategy::SizeBased => len >= config.max_batch_size,
        BatchStrategy::TimeBased => waited_long_enough(),
        BatchStrategy::Priority => {
            let urgent = pending
                .iter()
                .any(|m| m.priority >= config.priority_threshold);
            (urgent && len >= config.adaptive_min_batch) || len >= config.max_batch_size
        }
        BatchStrategy::Adaptive => {
            len >= adaptive_threshold(config, load) || waited_long_enough()
        }
    }
}

/// Holds the current [`BatchConfig`] and load reading.
///
/// The config is swapped wholesale; a flush decision always sees one
/// consistent config.
pub struct AdaptiveBatcher {
    config: RwLock<Arc<BatchConfig>>,
    load_bits: AtomicU64,
}

impl AdaptiveBatcher {
    /// Create a batcher at zero load.
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            load_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Config in effect.
    pub fn config(&self) -> Arc<BatchConfig> {
        self.config.read().clone()
    }

    /// Replace the config.
    pub fn set_config(&self, config: BatchConfig) {
        *self.config.write() = Arc::new(config);
    }

    /// Current load in `[0.0, 1.0]`.
    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Set the load; clamped into `[0.0, 1.0]`, NaN reads as zero.
    pub fn set_load(&self, load: f64) {
        let load = if load.is_nan() { 0.0 } else { load.clamp(0.0, 1.0) };
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);
    }

    /// Flush decision for `pending` as of now.
    pub fn should_flush_batch<T>(&self, pending: &[PendingMessage<T>]) -> bool {
        self.should_flush_at(pending, Instant::now())
    }

    /// Flush decision for `pending` as of `now`.
    pub fn should_flush_at<T>(&self, pending: &[PendingMessage<T>], now: Instant) -> bool {
        should_flush(&self.config(), self.load(), pending, now)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Why a batch was released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// The strategy fired on enqueue.
    Threshold,
    /// The periodic sweep found it due.
    Due,
    /// Explicit flush, key removal or shutdown.
    Forced,
}

impl FlushReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Due => "due",
            Self::Forced => "forced",
        }
    }
}

/// Messages released together for one key, in enqueue order.
#[derive(Debug)]
pub struct Batch<T> {
    /// Batch key.
    pub key: String,
    /// Released messages.
    pub messages: Vec<PendingMessage<T>>,
    /// What released them.
    pub reason: FlushReason,
}

impl<T> Batch<T> {
    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Payloads in enqueue order.
    pub fn into_payloads(self) -> Vec<T> {
        self.messages.into_iter().map(|m| m.payload).collect()
    }
}

/// Counters for the batching engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    /// Keys with a pending list.
    pub keys: usize,
    /// Messages waiting.
    pub pending: usize,
    /// Messages ever enqueued.
    pub enqueued: u64,
    /// Batches released.
    pub flushed_batches: u64,
    /// Messages released.
    pub flushed_messages: u64,
    /// Messages dropped without delivery.
    pub discarded: u64,
    /// Load reading in effect.
    pub load: f64,
    /// Strategy in effect.
    pub strategy: BatchStrategy,
}

struct Queue<T> {
    closed: bool,
    messages: Vec<PendingMessage<T>>,
}

impl<T> Queue<T> {
    fn new() -> Self {
        Self {
            closed: false,
            messages: Vec::new(),
        }
    }
}

/// Delivers released batches.
#[async_trait]
pub trait BatchSink<T: Send + 'static>: Send + Sync {
    /// Deliver one batch.
    async fn deliver(&self, batch: Batch<T>) -> Result<()>;
}

/// Per-key pending lists plus the flush policy.
pub struct BatchingEngine<T> {
    batcher: AdaptiveBatcher,
    queues: DashMap<String, Arc<Mutex<Queue<T>>>>,
    metrics: Arc<MetricsCollector>,
    enqueued: AtomicU64,
    flushed_batches: AtomicU64,
    flushed_messages: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Send + 'static> BatchingEngine<T> {
    /// Create an engine with `config`.
    pub fn new(config: BatchConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            batcher: AdaptiveBatcher::new(config),
            queues: DashMap::new(),
            metrics,
            enqueued: AtomicU64::new(0),
            flushed_batches: AtomicU64::new(0),
            flushed_messages: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Flush policy holder.
    pub fn batcher(&self) -> &AdaptiveBatcher {
        &self.batcher
    }

    /// Replace the config. Takes effect on the next decision.
    pub fn set_config(&self, config: BatchConfig) {
        self.batcher.set_config(config);
    }

    /// Update the load reading used by the adaptive strategy.
    pub fn set_load(&self, load: f64) {
        self.batcher.set_load(load);
    }

    /// Append a message to `key`. Returns the batch when this append
    /// triggered a flush.
    pub fn enqueue(&self, key: &str, payload: T, priority: i32) -> Option<Batch<T>> {
        let _ = self.enqueued.fetch_add(1, Ordering::Relaxed);
        loop {
            let queue = self.queue(key);
            let mut guard = queue.lock();
            if guard.closed {
                // removed concurrently; retry against a fresh list
                continue;
            }
            let now = Instant::now();
            guard.messages.push(PendingMessage::at(payload, priority, now));
            if !self.batcher.should_flush_at(&guard.messages, now) {
                return None;
            }
            let messages = mem::take(&mut guard.messages);
            drop(guard);
            return Some(self.released(key, messages, FlushReason::Threshold));
        }
    }

    fn queue(&self, key: &str) -> Arc<Mutex<Queue<T>>> {
        if let Some(q) = self.queues.get(key) {
            return q.value().clone();
        }
        self.queues
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Queue::new())))
            .value()
            .clone()
    }

    fn snapshot(&self) -> Vec<(String, Arc<Mutex<Queue<T>>>)> {
        self.queues
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn released(&self, key: &str, messages: Vec<PendingMessage<T>>, reason: FlushReason) -> Batch<T> {
        let _ = self.flushed_batches.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .flushed_messages
            .fetch_add(messages.len() as u64, Ordering::Relaxed);
        let mut tags = Tags::new();
        let _ = tags.insert("reason".to_string(), reason.as_str().to_string());
        self.metrics
            .record_counter(names::BATCH_FLUSHES_TOTAL, 1.0, tags);
        self.metrics
            .record_histogram(names::BATCH_SIZE, messages.len() as f64, Tags::new());
        Batch {
            key: key.to_string(),
            messages,
            reason,
        }
    }

    /// Release every list whose strategy fires now, e.g. time-based ones.
    pub fn flush_due(&self) -> Vec<Batch<T>> {
        let now = Instant::now();
        let mut batches = Vec::new();
        for (key, queue) in self.snapshot() {
            let mut guard = queue.lock();
            if self.batcher.should_flush_at(&guard.messages, now) {
                let messages = mem::take(&mut guard.messages);
                drop(guard);
                batches.push(self.released(&key, messages, FlushReason::Due));
            }
        }
        batches
    }

    /// Release whatever `key` holds.
    pub fn flush_key(&self, key: &str) -> Option<Batch<T>> {
        let queue = self.queues.get(key).map(|q| q.value().clone())?;
        let messages = mem::take(&mut queue.lock().messages);
        (!messages.is_empty()).then(|| self.released(key, messages, FlushReason::Forced))
    }

    /// Release every non-empty list.
    pub fn flush_all(&self) -> Vec<Batch<T>> {
        self.snapshot()
            .into_iter()
            .filter_map(|(key, queue)| {
                let messages = mem::take(&mut queue.lock().messages);
                (!messages.is_empty()).then(|| self.released(&key, messages, FlushReason::Forced))
            })
            .collect()
    }

    /// Drop `key`, returning what it still held.
    pub fn remove_key(&self, key: &str) -> Option<Batch<T>> {
        let (_, queue) = self.queues.remove(key)?;
        let messages = {
            let mut guard = queue.lock();
            guard.closed = true;
            mem::take(&mut guard.messages)
        };
        (!messages.is_empty()).then(|| self.released(key, messages, FlushReason::Forced))
    }

    /// Drop `key` and everything pending under it without delivery.
    /// Returns how many messages were dropped.
    pub fn discard_key(&self, key: &str) -> usize {
        let Some((_, queue)) = self.queues.remove(key) else {
            return 0;
        };
        let dropped = {
            let mut guard = queue.lock();
            guard.closed = true;
            mem::take(&mut guard.messages).len()
        };
        self.count_discarded(key, dropped);
        dropped
    }

    /// Drop an already released batch without delivery.
    pub fn discard(&self, batch: Batch<T>) {
        self.count_discarded(&batch.key, batch.len());
    }

    #[allow(clippy::cast_precision_loss)]
    fn count_discarded(&self, key: &str, dropped: usize) {
        if dropped == 0 {
            return;
        }
        let _ = self.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
        self.metrics
            .record_counter(names::BATCH_DISCARDED_TOTAL, dropped as f64, Tags::new());
        debug!(batch_key = %key, messages = dropped, "pending messages discarded");
    }

    /// Messages waiting under `key`.
    pub fn pending_len(&self, key: &str) -> usize {
        self.queues.get(key).map_or(0, |q| q.lock().messages.len())
    }

    /// Counters.
    pub fn stats(&self) -> BatchStats {
        let queues = self.snapshot();
        let pending = queues.iter().map(|(_, q)| q.lock().messages.len()).sum();
        BatchStats {
            keys: queues.len(),
            pending,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            flushed_batches: self.flushed_batches.load(Ordering::Relaxed),
            flushed_messages: self.flushed_messages.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            load: self.batcher.load(),
            strategy: self.batcher.config().strategy,
        }
    }

    /// Hand `batch` to `sink`, logging and counting a failure.
    pub async fn deliver(&self, sink: &dyn BatchSink<T>, batch: Batch<T>) {
        let key = batch.key.clone();
        let len = batch.len();
        if let Err(e) = sink.deliver(batch).await {
            warn!(batch_key = %key, messages = len, error = %e, "batch delivery failed");
            self.metrics
                .record_counter(names::BATCH_DELIVERY_FAILURES_TOTAL, 1.0, Tags::new());
        }
    }

    /// Sweep for due batches every flush interval until `cancel` fires,
    /// then deliver everything still pending.
    pub fn spawn_flusher(
        self: &Arc<Self>,
        sink: Arc<dyn BatchSink<T>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let period = this.batcher.config().flush_interval();
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for batch in this.flush_due() {
                    this.deliver(sink.as_ref(), batch).await;
                }
            }
            let remaining = this.flush_all();
            debug!(batches = remaining.len(), "draining pending batches");
            for batch in remaining {
                this.deliver(sink.as_ref(), batch).await;
            }
        })
    }
}

/// Sink writing each batch as one [`Frame::Batch`] to the connection whose
/// id is the batch key.
pub struct RegistrySink {
    registry: Arc<ConnectionRegistry>,
}

impl RegistrySink {
    /// Create a sink over `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl BatchSink<Bytes> for RegistrySink {
    async fn deliver(&self, batch: Batch<Bytes>) -> Result<()> {
        let id = ConnectionId::from(batch.key.as_str());
        let info = self.registry.lookup(&id)?;
        info.transport()
            .send(Frame::Batch(batch.into_payloads()))
            .await
            .map_err(|e| EngineError::transport(id.clone(), e))?;
        info.touch();
        Ok(())
    }
}
