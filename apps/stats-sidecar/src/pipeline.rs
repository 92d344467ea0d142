use crate::error::StatsError;
use crate::measurement::RawMeasurement;
use crate::stats::{
    BucketStrategy, ClosedWindow, OutputRecord, RecordFactory, RecordType, WindowedAggregator,
};
use crate::storage::StatsWriter;
use anyhow::Result;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const IDLE_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub enum PipelineCommand {
    Measurement(RawMeasurement),
    /// Writes interim rows for every open window, then answers.
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<PipelineCommand>,
    stats: Arc<PipelineStats>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<PipelineCommand>, stats: Arc<PipelineStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub async fn enqueue(&self, measurement: RawMeasurement) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, sensor = %measurement.sensor_id, "queued measurement");
        if let Err(err) = self.tx.send(PipelineCommand::Measurement(measurement)).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(PipelineCommand::Flush(tx)).await;
        let _ = rx.await;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub queue_depth: AtomicU64,
    pub accepted: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub late_dropped: AtomicU64,
    pub windows_closed: AtomicU64,
    pub snapshot_rows: AtomicU64,
    pub rows_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub last_write_unix_ms: AtomicU64,
    pub average_write_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

/// Plain copy of the counters, for logging and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    pub queue_depth: u64,
    pub accepted: u64,
    pub malformed_dropped: u64,
    pub late_dropped: u64,
    pub windows_closed: u64,
    pub snapshot_rows: u64,
    pub rows_written: u64,
    pub write_failures: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            late_dropped: self.late_dropped.load(Ordering::Relaxed),
            windows_closed: self.windows_closed.load(Ordering::Relaxed),
            snapshot_rows: self.snapshot_rows.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
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

    fn record_write(&self, elapsed: Duration) {
        self.rows_written.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_write_unix_ms.store(now, Ordering::Relaxed);
        let micros = elapsed.as_micros() as u64;
        let prev = self.average_write_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_write_micros.store(avg, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerOptions {
    /// Interim rows for open windows are written this often; `None` disables them.
    pub emit_interval: Option<Duration>,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
}

/// A worker stopped on a non-recoverable error.
#[derive(Debug)]
pub struct PipelineHalt {
    pub record_type: RecordType,
    pub shard: usize,
    pub error: StatsError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Emission {
    Interim,
    Final,
}

struct Worker<S, F> {
    shard: usize,
    aggregator: WindowedAggregator<S>,
    factory: F,
    writer: StatsWriter,
    stats: Arc<PipelineStats>,
    options: WorkerOptions,
}

impl<S: BucketStrategy, F: RecordFactory> Worker<S, F> {
    async fn run(&mut self, rx: &mut mpsc::Receiver<PipelineCommand>) -> Result<(), StatsError> {
        let mut ticker = tokio::time::interval(self.options.emit_interval.unwrap_or(IDLE_TICK));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let interim_enabled = self.options.emit_interval.is_some();

        loop {
            tokio::select! {
                _ = ticker.tick(), if interim_enabled => {
                    self.emit_snapshot().await?;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(PipelineCommand::Measurement(measurement)) => {
                            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            self.ingest(measurement).await?;
                        }
                        Some(PipelineCommand::Flush(done)) => {
                            self.emit_snapshot().await?;
                            let _ = done.send(());
                        }
                        None => {
                            let open = self.aggregator.drain();
                            tracing::info!(
                                record_type = %self.factory.record_type(),
                                shard = self.shard,
                                windows = open.len(),
                                "closing open windows on shutdown"
                            );
                            self.emit(open, Emission::Final).await?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn ingest(&mut self, measurement: RawMeasurement) -> Result<(), StatsError> {
        match self.aggregator.ingest(&measurement) {
            Ok(outcome) => {
                if outcome.dropped_late() {
                    self.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        record_type = %self.factory.record_type(),
                        sensor = %measurement.sensor_id,
                        timestamp_ms = measurement.timestamp_ms,
                        watermark_ms = ?self.aggregator.watermark_ms(),
                        "dropped late measurement"
                    );
                } else {
                    self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                }
                if !outcome.closed.is_empty() {
                    self.emit(outcome.closed, Emission::Final).await?;
                }
                Ok(())
            }
            Err(err) if err.is_malformed_input() => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %err, "dropped malformed measurement");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn emit_snapshot(&mut self) -> Result<(), StatsError> {
        let open = self.aggregator.snapshot();
        if open.is_empty() {
            return Ok(());
        }
        self.emit(open, Emission::Interim).await
    }

    async fn emit(&mut self, windows: Vec<ClosedWindow>, emission: Emission) -> Result<(), StatsError> {
        for window in windows {
            let sensor_id = self.aggregator.strategy().extract_sensor_id(&window.key);
            let record = self
                .factory
                .create(sensor_id, &window.key, window.bounds, &window.stats)?;
            match emission {
                Emission::Final => {
                    self.stats.windows_closed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        record_type = %record.record_type(),
                        sensor = %sensor_id,
                        period = %window.bounds,
                        count = window.stats.count(),
                        "window closed"
                    );
                }
                Emission::Interim => {
                    self.stats.snapshot_rows.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.write_with_retry(&record).await?;
        }
        Ok(())
    }

    /// Retries store failures with linear backoff, then gives the row up. Anything else
    /// is returned and halts the worker.
    async fn write_with_retry(&self, record: &OutputRecord) -> Result<(), StatsError> {
        let max_attempts = self.options.retry_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.writer.write(record).await {
                Ok(()) => {
                    self.stats.record_write(started.elapsed());
                    self.stats.clear_error();
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        error = %err,
                        attempt,
                        max_attempts,
                        sensor = %record.sensor_id(),
                        "stats write failed; retrying"
                    );
                    tokio::time::sleep(self.options.retry_backoff * attempt).await;
                }
                Err(err) if err.is_retryable() => {
                    self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_error(err.to_string());
                    tracing::error!(
                        error = %err,
                        attempts = attempt,
                        record_type = %record.record_type(),
                        sensor = %record.sensor_id(),
                        "giving up on stats row"
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn spawn_worker<S, F>(
    shard: usize,
    aggregator: WindowedAggregator<S>,
    factory: F,
    writer: StatsWriter,
    mut rx: mpsc::Receiver<PipelineCommand>,
    stats: Arc<PipelineStats>,
    options: WorkerOptions,
    halt_tx: mpsc::UnboundedSender<PipelineHalt>,
) -> JoinHandle<()>
where
    S: BucketStrategy,
    F: RecordFactory,
{
    tokio::spawn(async move {
        let record_type = factory.record_type();
        let mut worker = Worker {
            shard,
            aggregator,
            factory,
            writer,
            stats: stats.clone(),
            options,
        };
        if let Err(error) = worker.run(&mut rx).await {
            stats.record_error(error.to_string());
            tracing::error!(error = %error, %record_type, shard, "stats pipeline halted");
            let _ = halt_tx.send(PipelineHalt {
                record_type,
                shard,
                error,
            });
        }
    })
}
