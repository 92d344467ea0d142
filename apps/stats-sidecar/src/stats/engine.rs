use super::accumulator::{ensure_finite, StatsAccumulator};
use super::bucket::{BucketKey, BucketStrategy};
use super::records::OutputRecord;
use super::window::{WindowBounds, WindowSpec};
use crate::error::StatsError;
use crate::measurement::RawMeasurement;
use std::collections::BTreeMap;

/// A window that will receive no further measurements.
#[derive(Clone, Debug)]
pub struct ClosedWindow {
    pub key: BucketKey,
    pub bounds: WindowBounds,
    pub stats: StatsAccumulator,
}

impl ClosedWindow {
    /// Window state carried by a previously written record.
    pub fn from_record(record: &OutputRecord) -> Result<Self, StatsError> {
        Ok(Self {
            key: record.bucket_key(),
            bounds: record.bounds(),
            stats: record.stats().to_accumulator(record.record_type())?,
        })
    }
}

#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// Open window instances the measurement was folded into.
    pub updated: usize,
    /// Instances the measurement belonged to that had already closed.
    pub late: usize,
    pub closed: Vec<ClosedWindow>,
}

impl IngestOutcome {
    pub fn dropped_late(&self) -> bool {
        self.updated == 0 && self.late > 0
    }
}

/// Regroups measurements by bucket key and folds them into per-window accumulators.
///
/// Closing is driven by stream time: the watermark is the largest timestamp seen so far
/// minus `grace_ms`, and an instance `[start, end)` closes once `end <= watermark`.
/// Measurements for closed instances are rejected and reported as late.
#[derive(Debug)]
pub struct WindowedAggregator<S> {
    strategy: S,
    spec: WindowSpec,
    grace_ms: i64,
    stream_time_ms: Option<i64>,
    // Ordered by window end so closing pops from the front.
    open: BTreeMap<(i64, BucketKey), StatsAccumulator>,
}

impl<S: BucketStrategy> WindowedAggregator<S> {
    pub fn new(strategy: S, spec: WindowSpec, grace_ms: i64) -> Self {
        Self {
            strategy,
            spec,
            grace_ms: grace_ms.max(0),
            stream_time_ms: None,
            open: BTreeMap::new(),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn spec(&self) -> WindowSpec {
        self.spec
    }

    pub fn open_windows(&self) -> usize {
        self.open.len()
    }

    pub fn watermark_ms(&self) -> Option<i64> {
        self.stream_time_ms
            .map(|observed| observed.saturating_sub(self.grace_ms))
    }

    pub fn ingest(&mut self, measurement: &RawMeasurement) -> Result<IngestOutcome, StatsError> {
        ensure_finite(&measurement.sensor_id, measurement.value_watts)?;
        let key = self
            .strategy
            .derive_key(&measurement.sensor_id, measurement.timestamp_ms)?;

        let observed = self
            .stream_time_ms
            .map_or(measurement.timestamp_ms, |prev| prev.max(measurement.timestamp_ms));
        self.stream_time_ms = Some(observed);
        let watermark = observed.saturating_sub(self.grace_ms);

        let mut outcome = IngestOutcome::default();
        for bounds in self.spec.windows_for(measurement.timestamp_ms) {
            if bounds.end_ms <= watermark {
                outcome.late += 1;
                continue;
            }
            self.open
                .entry((bounds.end_ms, key.clone()))
                .or_default()
                .accumulate(&measurement.sensor_id, measurement.value_watts)?;
            outcome.updated += 1;
        }

        outcome.closed = self.close_until(watermark);
        Ok(outcome)
    }

    /// Seeds an open window with statistics written by an earlier run, merging them
    /// into anything already accumulated for the same instance. Windows that are not on
    /// this grid, or that the watermark has already closed, are refused.
    pub fn restore(&mut self, window: ClosedWindow) -> bool {
        let on_grid = window.bounds == self.bounds_ending_at(window.bounds.end_ms)
            && window.bounds.start_ms.rem_euclid(self.spec.advance_ms()) == 0;
        let closed = self
            .watermark_ms()
            .is_some_and(|watermark| window.bounds.end_ms <= watermark);
        if !on_grid || closed || window.stats.is_empty() {
            return false;
        }
        let entry = self
            .open
            .entry((window.bounds.end_ms, window.key))
            .or_default();
        *entry = entry.merge(&window.stats);
        true
    }

    /// Read-only view of every open window, for interim emission.
    pub fn snapshot(&self) -> Vec<ClosedWindow> {
        self.open
            .iter()
            .map(|((end_ms, key), stats)| ClosedWindow {
                key: key.clone(),
                bounds: self.bounds_ending_at(*end_ms),
                stats: *stats,
            })
            .collect()
    }

    /// Closes every open window regardless of the watermark. Used on shutdown.
    pub fn drain(&mut self) -> Vec<ClosedWindow> {
        let open = std::mem::take(&mut self.open);
        open.into_iter()
            .map(|((end_ms, key), stats)| ClosedWindow {
                key,
                bounds: self.bounds_ending_at(end_ms),
                stats,
            })
            .collect()
    }

    fn close_until(&mut self, watermark: i64) -> Vec<ClosedWindow> {
        let mut closed = Vec::new();
        while let Some(entry) = self.open.first_entry() {
            let end_ms = entry.key().0;
            if end_ms > watermark {
                break;
            }
            let ((_, key), stats) = entry.remove_entry();
            closed.push(ClosedWindow {
                key,
                bounds: self.bounds_ending_at(end_ms),
                stats,
            });
        }
        closed
    }

    fn bounds_ending_at(&self, end_ms: i64) -> WindowBounds {
        WindowBounds {
            start_ms: end_ms.saturating_sub(self.spec.size_ms()),
            end_ms,
        }
    }
}
