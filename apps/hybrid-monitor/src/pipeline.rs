//! Host-side pipeline: reassemble, parse, estimate, ingest.
//!
//! Everything here runs on one thread. That thread is the only writer of battery state and of
//! the store, so estimator updates are applied strictly in frame arrival order.

use crate::backoff::Backoff;
use crate::error::{FrameError, PersistenceError};
use crate::estimator::{save_snapshot, Estimator, EstimatorStale};
use crate::frame::{parse_frame, FrameAssembler};
use crate::ingest::{IngestStats, Ingestor, SampleSink};
use crate::telemetry::TelemetrySample;
use crate::transport::{FrameTransport, ReadOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;


#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_accepted: AtomicU64,
    pub frames_malformed: AtomicU64,
    pub frames_out_of_range: AtomicU64,
    pub stale_estimates: AtomicU64,
    pub transport_faults: AtomicU64,
    pub reconnects: AtomicU64,
    /// Frames captured before the last accepted timestamp.
    pub clock_regressions: AtomicU64,
    pub ingest: Arc<IngestStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_accepted: u64,
    pub frames_malformed: u64,
    pub frames_out_of_range: u64,
    pub stale_estimates: u64,
    pub transport_faults: u64,
    pub reconnects: u64,
    pub clock_regressions: u64,
    pub persisted: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub out_of_order: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_accepted: load(&self.frames_accepted),
            frames_malformed: load(&self.frames_malformed),
            frames_out_of_range: load(&self.frames_out_of_range),
            stale_estimates: load(&self.stale_estimates),
            transport_faults: load(&self.transport_faults),
            reconnects: load(&self.reconnects),
            clock_regressions: load(&self.clock_regressions),
            persisted: load(&self.ingest.persisted),
            buffered: load(&self.ingest.buffered),
            dropped: load(&self.ingest.dropped),
            out_of_order: load(&self.ingest.out_of_order),
        }
    }

    pub fn log_status(&self) {
        let s = self.snapshot();
        tracing::info!(
            accepted = s.frames_accepted,
            malformed = s.frames_malformed,
            out_of_range = s.frames_out_of_range,
            stale = s.stale_estimates,
            persisted = s.persisted,
            buffered = s.buffered,
            dropped = s.dropped,
            reconnects = s.reconnects,
            clock_regressions = s.clock_regressions,
            "pipeline status"
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Durable in the store.
    Stored {
        timestamp: i64,
        stale: Option<EstimatorStale>,
    },
    /// Accepted but waiting in the ingest buffer.
    Buffered {
        timestamp: i64,
        stale: Option<EstimatorStale>,
        buffered: usize,
    },
    Rejected(FrameError),
    /// The store already holds newer rows than this sample.
    OutOfOrder { timestamp: i64, last: i64 },
}

struct SnapshotPolicy {
    path: PathBuf,
    every: u64,
    since_last: u64,
}

pub struct Pipeline<S: SampleSink> {
    assembler: FrameAssembler,
    estimator: Estimator,
    ingestor: Ingestor<S>,
    stats: Arc<PipelineStats>,
    snapshots: Option<SnapshotPolicy>,
    clock_behind: bool,
}

impl<S: SampleSink> Pipeline<S> {
    pub fn new(estimator: Estimator, ingestor: Ingestor<S>, stats: Arc<PipelineStats>) -> Self {
        Self {
            assembler: FrameAssembler::default(),
            estimator,
            ingestor,
            stats,
            snapshots: None,
            clock_behind: false,
        }
    }

    /// Persists battery state every `every` accepted samples and at shutdown.
    pub fn with_snapshots(mut self, path: impl Into<PathBuf>, every: u64) -> Self {
        self.snapshots = Some(SnapshotPolicy {
            path: path.into(),
            every: every.max(1),
            since_last: 0,
        });
        self
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }

    pub fn ingestor(&self) -> &Ingestor<S> {
        &self.ingestor
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Feeds a raw read. Every frame completed by it is stamped with `captured_at`.
    pub fn push_bytes(&mut self, bytes: &[u8], captured_at: DateTime<Utc>) -> Vec<FrameOutcome> {
        self.assembler
            .push(bytes)
            .into_iter()
            .map(|raw| self.process_frame(&raw, captured_at))
            .collect()
    }

    /// Runs one complete frame through parse, estimate and ingest.
    pub fn process_frame(&mut self, raw: &[u8], captured_at: DateTime<Utc>) -> FrameOutcome {
        let frame = match parse_frame(raw).and_then(|fields| fields.to_raw_frame()) {
            Ok(frame) => frame,
            Err(err) => {
                let counter = match err {
                    FrameError::MalformedFrame(_) => &self.stats.frames_malformed,
                    FrameError::OutOfRange { .. } => &self.stats.frames_out_of_range,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, "dropping frame");
                return FrameOutcome::Rejected(err);
            }
        };

        // A clock that stepped backwards still yields a sample: it is stored at the last accepted
        // timestamp to keep storage order, and the estimator sees the real, non-positive step.
        let mut timestamp = captured_at.timestamp();
        match self.ingestor.last_timestamp() {
            Some(last) if timestamp < last => {
                self.stats.clock_regressions.fetch_add(1, Ordering::Relaxed);
                if !self.clock_behind {
                    tracing::warn!(
                        captured = timestamp,
                        last,
                        "clock stepped backwards; holding timestamps until it catches up"
                    );
                }
                self.clock_behind = true;
                timestamp = last;
            }
            _ => {
                if self.clock_behind {
                    tracing::info!(timestamp, "clock caught up with stored samples");
                }
                self.clock_behind = false;
            }
        }

        let estimate = self.estimator.update(&frame, captured_at);
        if let Some(reason) = estimate.stale {
            self.stats.stale_estimates.fetch_add(1, Ordering::Relaxed);
            if self.clock_behind {
                tracing::debug!(%reason, timestamp, "battery estimate held");
            } else {
                tracing::warn!(%reason, timestamp, "battery estimate held");
            }
        }
        self.stats.frames_accepted.fetch_add(1, Ordering::Relaxed);

        let sample = TelemetrySample {
            id: None,
            timestamp,
            v_pv: frame.v_pv,
            i_pv: frame.i_pv,
            v_wind: frame.v_wind,
            i_wind: frame.i_wind,
            v_bat: estimate.v_bat,
            soc: estimate.soc,
            wind_speed: estimate.wind_speed,
            lux: frame.lux,
            fan_pwm: frame.fan_pwm,
            estimate_stale: estimate.stale.is_some(),
        };

        let outcome = match self.ingestor.ingest(sample, Instant::now()) {
            Ok(_) => FrameOutcome::Stored {
                timestamp,
                stale: estimate.stale,
            },
            Err(PersistenceError::Unavailable { buffered, .. }) => FrameOutcome::Buffered {
                timestamp,
                stale: estimate.stale,
                buffered,
            },
            Err(PersistenceError::OutOfOrder { timestamp, last }) => {
                FrameOutcome::OutOfOrder { timestamp, last }
            }
        };
        self.maybe_snapshot();
        outcome
    }

    /// Called when a read times out: retries any buffered backlog that is due.
    pub fn on_idle(&mut self) {
        if let Err(err) = self.ingestor.poll(Instant::now()) {
            tracing::debug!(error = %err, "backlog retry failed");
        }
    }

    /// Called after the link dropped; a half-received frame is discarded.
    pub fn on_link_lost(&mut self) {
        self.assembler.reset();
    }

    /// Flushes the ingest buffer and writes a final battery snapshot.
    pub fn shutdown(&mut self) -> Result<()> {
        let flushed = self.ingestor.flush();
        if let Some(policy) = self.snapshots.as_mut() {
            if let Some(state) = self.estimator.state() {
                save_snapshot(&policy.path, &state)?;
                policy.since_last = 0;
            }
        }
        match flushed {
            Ok(written) => {
                tracing::info!(written, "ingest buffer flushed");
                Ok(())
            }
            Err(err) => Err(err).context("final ingest flush failed"),
        }
    }

    fn maybe_snapshot(&mut self) {
        let Some(policy) = self.snapshots.as_mut() else {
            return;
        };
        policy.since_last += 1;
        if policy.since_last < policy.every {
            return;
        }
        let Some(state) = self.estimator.state() else {
            return;
        };
        match save_snapshot(&policy.path, &state) {
            Ok(()) => policy.since_last = 0,
            Err(err) => tracing::warn!(error = %err, "failed to persist battery state"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    pub read_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Drives `pipeline` from `transport` until cancelled or the source closes.
///
/// Cancellation is checked between reads, so a frame already being processed always completes.
/// Returns the pipeline after its shutdown flush.
pub fn run_reader<T, S, C>(
    mut transport: T,
    mut pipeline: Pipeline<S>,
    cfg: ReaderConfig,
    clock: C,
    cancel: CancellationToken,
) -> Pipeline<S>
where
    T: FrameTransport,
    S: SampleSink,
    C: Fn() -> DateTime<Utc>,
{
    let stats = pipeline.stats();
    let mut backoff = Backoff::new(cfg.reconnect_initial, cfg.reconnect_max);
    tracing::info!(source = %transport.describe(), "reader started");

    'read: while !cancel.is_cancelled() {
        match transport.read_chunk(cfg.read_timeout) {
            Ok(ReadOutcome::Data(bytes)) => {
                pipeline.push_bytes(&bytes, clock());
            }
            Ok(ReadOutcome::Timeout) => pipeline.on_idle(),
            Ok(ReadOutcome::Closed) => {
                tracing::info!(source = %transport.describe(), "source closed");
                break;
            }
            Err(fault) => {
                stats.transport_faults.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %fault, "link lost; reconnecting");
                pipeline.on_link_lost();
                loop {
                    let delay = backoff.next_delay();
                    if sleep_unless_cancelled(delay, &cancel) {
                        break 'read;
                    }
                    pipeline.on_idle();
                    match transport.reconnect() {
                        Ok(()) => {
                            stats.reconnects.fetch_add(1, Ordering::Relaxed);
                            backoff.reset();
                            tracing::info!(source = %transport.describe(), "link re-established");
                            break;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "reconnect failed")
                        }
                    }
                }
            }
        }
    }

    if let Err(err) = pipeline.shutdown() {
        tracing::warn!(error = %err, "pipeline shutdown incomplete");
    }
    pipeline
}

/// Sleeps in short slices. Returns `true` if cancellation was observed.
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

/// Runs the reader on a dedicated named thread.
pub fn spawn_reader<T, S>(
    transport: T,
    pipeline: Pipeline<S>,
    cfg: ReaderConfig,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>>
where
    T: FrameTransport + 'static,
    S: SampleSink + 'static,
{
    let handle = std::thread::Builder::new()
        .name("serial-reader".to_string())
        .spawn(move || {
            let pipeline = run_reader(transport, pipeline, cfg, Utc::now, cancel);
            pipeline.stats().log_status();
        })
        .context("failed to spawn reader thread")?;
    Ok(handle)
}
