//! Durable, ordered appends with bounded in-memory backpressure.

use crate::backoff::Backoff;
use crate::error::PersistenceError;
use crate::telemetry::TelemetrySample;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Storage the ingestor appends to.
pub trait SampleSink: Send {
    /// Appends atomically in order and returns the assigned ids.
    fn append(&mut self, samples: &[TelemetrySample]) -> Result<Vec<i64>, PersistenceError>;

    /// Newest timestamp already stored, if known.
    fn last_timestamp(&self) -> Option<i64> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub buffer_capacity: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 3600,
            retry_initial: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub persisted: AtomicU64,
    pub buffered: AtomicU64,
    pub dropped: AtomicU64,
    pub out_of_order: AtomicU64,
    pub write_failures: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestAck {
    /// Samples written by this call, including previously buffered ones.
    pub persisted: usize,
    pub dropped_oldest: usize,
}

/// Single writer in front of a [`SampleSink`].
///
/// Samples are queued in arrival order and flushed as one batch. While the sink is failing the
/// queue grows up to `buffer_capacity`; past that the oldest sample is shed, never the newest.
pub struct Ingestor<S: SampleSink> {
    sink: S,
    pending: VecDeque<TelemetrySample>,
    capacity: usize,
    backoff: Backoff,
    retry_at: Option<Instant>,
    last_ts: Option<i64>,
    stats: Arc<IngestStats>,
}

impl<S: SampleSink> Ingestor<S> {
    pub fn new(sink: S, cfg: IngestConfig, stats: Arc<IngestStats>) -> Self {
        let last_ts = sink.last_timestamp();
        Self {
            sink,
            pending: VecDeque::new(),
            capacity: cfg.buffer_capacity.max(1),
            backoff: Backoff::new(cfg.retry_initial, cfg.retry_max),
            retry_at: None,
            last_ts,
            stats,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Timestamp of the newest accepted sample, stored or buffered.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_ts
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Queues `sample` and writes the queue unless a retry backoff is in effect.
    ///
    /// `Err(Unavailable)` means the sample is buffered but not yet durable.
    pub fn ingest(
        &mut self,
        sample: TelemetrySample,
        now: Instant,
    ) -> Result<IngestAck, PersistenceError> {
        if let Some(last) = self.last_ts {
            if sample.timestamp < last {
                self.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                return Err(PersistenceError::OutOfOrder {
                    timestamp: sample.timestamp,
                    last,
                });
            }
        }
        self.last_ts = Some(sample.timestamp);
        self.pending.push_back(sample);

        let mut dropped_oldest = 0;
        while self.pending.len() > self.capacity {
            if let Some(dropped) = self.pending.pop_front() {
                dropped_oldest += 1;
                let total = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    timestamp = dropped.timestamp,
                    dropped_total = total,
                    capacity = self.capacity,
                    "ingest buffer full; dropped oldest sample"
                );
            }
        }
        self.publish_depth();

        if self.retry_at.is_some_and(|at| now < at) {
            return Err(self.unavailable("retry backoff in effect"));
        }
        let persisted = self.write_pending(now)?;
        Ok(IngestAck {
            persisted,
            dropped_oldest,
        })
    }

    /// Retries a buffered backlog once its backoff has elapsed. Returns the number written.
    pub fn poll(&mut self, now: Instant) -> Result<usize, PersistenceError> {
        if self.pending.is_empty() || self.retry_at.is_some_and(|at| now < at) {
            return Ok(0);
        }
        self.write_pending(now)
    }

    /// Writes the backlog immediately, ignoring any backoff. Used on shutdown.
    pub fn flush(&mut self) -> Result<usize, PersistenceError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        self.write_pending(Instant::now())
    }

    fn write_pending(&mut self, now: Instant) -> Result<usize, PersistenceError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let result = self.sink.append(self.pending.make_contiguous());
        match result {
            Ok(ids) => {
                let written = self.pending.len();
                debug_assert_eq!(ids.len(), written);
                self.pending.clear();
                self.retry_at = None;
                self.backoff.reset();
                self.stats
                    .persisted
                    .fetch_add(written as u64, Ordering::Relaxed);
                self.stats.clear_error();
                self.publish_depth();
                Ok(written)
            }
            Err(PersistenceError::OutOfOrder { timestamp, last }) => {
                // The store already holds newer rows than this backlog; shed what it rejects.
                let before = self.pending.len();
                self.pending.retain(|s| s.timestamp >= last);
                self.last_ts = self.last_ts.max(Some(last));
                let shed = before - self.pending.len();
                self.stats
                    .out_of_order
                    .fetch_add(shed as u64, Ordering::Relaxed);
                tracing::warn!(timestamp, last, shed, "store rejected out-of-order samples");
                self.publish_depth();
                if shed == 0 {
                    self.pending.clear();
                    return Err(PersistenceError::OutOfOrder { timestamp, last });
                }
                self.write_pending(now)
            }
            Err(PersistenceError::Unavailable { reason, .. }) => {
                let delay = self.backoff.next_delay();
                self.retry_at = Some(now + delay);
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(reason.clone());
                tracing::warn!(
                    error = %reason,
                    pending = self.pending.len(),
                    retry_in_ms = delay.as_millis() as u64,
                    "telemetry write failed; buffering"
                );
                Err(self.unavailable(reason))
            }
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> PersistenceError {
        PersistenceError::Unavailable {
            reason: reason.into(),
            buffered: self.pending.len(),
        }
    }

    fn publish_depth(&self) {
        self.stats
            .buffered
            .store(self.pending.len() as u64, Ordering::Relaxed);
    }
}
