use super::*;
use crate::error::StatsError;
use crate::measurement::RawMeasurement;
use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use chrono_tz::Europe::Paris;
use std::time::Duration;

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn ts(zone_utc: (i32, u32, u32, u32, u32)) -> i64 {
    let (y, mo, d, h, mi) = zone_utc;
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
        .single()
        .expect("valid utc time")
        .timestamp_millis()
}

fn utc_hours(size_ms: i64) -> WindowedAggregator<HourOfDayBuckets> {
    WindowedAggregator::new(
        HourOfDayBuckets::new(Tz::UTC),
        WindowSpec::from_millis(size_ms, size_ms).expect("window"),
        0,
    )
}

#[test]
fn accumulator_summarizes_values() {
    let acc = StatsAccumulator::from_values([10.0, 20.0, 30.0]);
    assert_eq!(acc.count(), 3);
    assert!(approx(acc.mean(), 20.0));
    assert!(approx(acc.variance(), 200.0 / 3.0));
    assert_eq!(acc.min(), 10.0);
    assert_eq!(acc.max(), 30.0);
}

#[test]
fn single_value_has_zero_spread() {
    let acc = StatsAccumulator::from_values([42.0]);
    assert_eq!(acc.count(), 1);
    assert_eq!(acc.stddev(), 0.0);
    assert_eq!(acc.min(), acc.max());
}

#[test]
fn merge_matches_sequential_accumulation() {
    let values = [3.5, -1.0, 250.0, 0.0, 12.25, 12.25, 7.0, 1e4];
    let whole = StatsAccumulator::from_values(values);
    for split in 0..=values.len() {
        let (left, right) = values.split_at(split);
        let merged = StatsAccumulator::from_values(left.iter().copied())
            .merge(&StatsAccumulator::from_values(right.iter().copied()));
        assert_eq!(merged.count(), whole.count(), "split {split}");
        assert!(approx(merged.mean(), whole.mean()), "split {split}");
        assert!(approx(merged.variance(), whole.variance()), "split {split}");
        assert_eq!(merged.min(), whole.min());
        assert_eq!(merged.max(), whole.max());
    }
}

#[test]
fn non_finite_values_are_rejected_without_mutation() {
    let mut acc = StatsAccumulator::from_values([1.0, 2.0]);
    let before = acc;
    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let err = acc.accumulate("s1", bad).unwrap_err();
        assert!(matches!(err, StatsError::NonFiniteValue { .. }));
        assert!(err.is_malformed_input());
    }
    assert_eq!(acc, before);
    assert_eq!(StatsAccumulator::from_values([1.0, f64::NAN]).count(), 1);
}

#[test]
fn localizes_paris_winter_and_summer_time() {
    // 2021-03-01 is a Monday; Paris is UTC+1.
    let winter = CalendarTime::localize(Paris, "s1", 1_614_558_600_000).expect("winter");
    assert_eq!(winter.day_of_week, 1);
    assert_eq!(winter.hour_of_day, 1);

    // After the 2021-03-28 switch Paris is UTC+2.
    let summer =
        CalendarTime::localize(Paris, "s1", ts((2021, 3, 28, 1, 30))).expect("summer");
    assert_eq!(summer.day_of_week, 7);
    assert_eq!(summer.hour_of_day, 3);

    let late_sunday = CalendarTime::localize(Paris, "s1", ts((2021, 3, 7, 23, 30))).expect("dow");
    assert_eq!(late_sunday.day_of_week, 1);
    assert_eq!(late_sunday.hour_of_day, 0);
}

#[test]
fn out_of_range_timestamp_is_malformed() {
    let err = DayOfWeekBuckets::new(Paris)
        .derive_key("s1", i64::MAX)
        .unwrap_err();
    assert!(matches!(err, StatsError::InvalidTimestamp { .. }));
    assert!(err.is_malformed_input());
}

#[test]
fn hour_of_week_composes_day_and_hour() {
    let dow = DayOfWeekBuckets::new(Paris);
    let hod = HourOfDayBuckets::new(Paris);
    let how = HourOfWeekBuckets::new(Paris);
    // Covers both DST transitions of 2021.
    let start = ts((2021, 1, 1, 0, 0));
    let end = ts((2022, 1, 1, 0, 0));
    let step = 17 * 60 * 1000;
    let mut at = start;
    while at < end {
        let BucketKey::DayOfWeek { day_of_week, .. } = dow.derive_key("s1", at).expect("dow")
        else {
            panic!("wrong key kind");
        };
        let BucketKey::HourOfDay { hour_of_day, .. } = hod.derive_key("s1", at).expect("hod")
        else {
            panic!("wrong key kind");
        };
        assert_eq!(
            how.derive_key("s1", at).expect("how"),
            BucketKey::HourOfWeek {
                day_of_week,
                hour_of_day,
                sensor_id: "s1".to_string(),
            }
        );
        at += step;
    }
}

#[test]
fn strategy_recovers_sensor_id() {
    let strategy = HourOfWeekBuckets::new(Paris);
    let key = strategy.derive_key("meter-7", 0).expect("key");
    assert_eq!(strategy.extract_sensor_id(&key), "meter-7");
}

#[test]
fn tumbling_window_yields_one_instance() {
    let spec = WindowSpec::days(1, 1).expect("spec");
    assert!(spec.is_tumbling());
    let at = ts((2021, 3, 1, 12, 0));
    let windows = spec.windows_for(at);
    assert_eq!(windows.len(), 1);
    assert!(windows[0].contains(at));
    assert_eq!(windows[0].start_ms % DAY_MS, 0);
}

#[test]
fn hopping_window_yields_size_over_advance_instances() {
    let spec = WindowSpec::days(7, 1).expect("spec");
    let at = ts((2021, 3, 3, 5, 0));
    let windows = spec.windows_for(at);
    assert_eq!(windows.len(), 7);
    for pair in windows.windows(2) {
        assert_eq!(pair[1].start_ms - pair[0].start_ms, spec.advance_ms());
    }
    for window in &windows {
        assert!(window.contains(at));
        assert_eq!(window.end_ms - window.start_ms, 7 * DAY_MS);
        assert_eq!(window.start_ms.rem_euclid(DAY_MS), 0);
    }
}

#[test]
fn window_bounds_are_half_open() {
    let spec = WindowSpec::tumbling(Duration::from_secs(1)).expect("spec");
    let at_boundary = spec.windows_for(1_000);
    assert_eq!(at_boundary, vec![WindowBounds { start_ms: 1_000, end_ms: 2_000 }]);
    let before = spec.windows_for(999);
    assert_eq!(before, vec![WindowBounds { start_ms: 0, end_ms: 1_000 }]);
    assert!(!before[0].contains(1_000));
}

#[test]
fn negative_timestamps_align_to_the_same_grid() {
    let spec = WindowSpec::from_millis(3_000, 1_000).expect("spec");
    let windows = spec.windows_for(-1);
    assert_eq!(
        windows.iter().map(|w| w.start_ms).collect::<Vec<_>>(),
        vec![-3_000, -2_000, -1_000]
    );
}

#[test]
fn invalid_window_specs_are_rejected() {
    assert!(WindowSpec::from_millis(0, 0).is_err());
    assert!(WindowSpec::from_millis(1_000, 0).is_err());
    assert!(WindowSpec::from_millis(1_000, 2_000).is_err());
    assert!(WindowSpec::days(0, 1).is_err());
}

#[test]
fn windows_close_when_stream_time_passes_their_end() {
    let mut agg = utc_hours(1_000);
    let first = agg.ingest(&RawMeasurement::new("s1", 100, 1.0)).expect("ingest");
    assert_eq!(first.updated, 1);
    assert!(first.closed.is_empty());
    agg.ingest(&RawMeasurement::new("s1", 500, 3.0)).expect("ingest");
    assert_eq!(agg.open_windows(), 1);

    let outcome = agg.ingest(&RawMeasurement::new("s1", 1_000, 10.0)).expect("ingest");
    assert_eq!(outcome.closed.len(), 1);
    let closed = &outcome.closed[0];
    assert_eq!(closed.bounds, WindowBounds { start_ms: 0, end_ms: 1_000 });
    assert_eq!(closed.stats.count(), 2);
    assert!(approx(closed.stats.mean(), 2.0));
    assert_eq!(agg.open_windows(), 1);
}

#[test]
fn measurements_for_closed_windows_are_dropped_late() {
    let mut agg = utc_hours(1_000);
    agg.ingest(&RawMeasurement::new("s1", 100, 1.0)).expect("ingest");
    agg.ingest(&RawMeasurement::new("s1", 1_500, 1.0)).expect("ingest");

    let late = agg.ingest(&RawMeasurement::new("s1", 999, 5.0)).expect("ingest");
    assert!(late.dropped_late());
    assert_eq!(late.updated, 0);
    assert_eq!(late.late, 1);
    assert_eq!(agg.watermark_ms(), Some(1_500));
}

#[test]
fn grace_keeps_windows_open_for_out_of_order_data() {
    let mut agg = WindowedAggregator::new(
        HourOfDayBuckets::new(Tz::UTC),
        WindowSpec::from_millis(1_000, 1_000).expect("window"),
        500,
    );
    agg.ingest(&RawMeasurement::new("s1", 1_200, 1.0)).expect("ingest");
    let reordered = agg.ingest(&RawMeasurement::new("s1", 900, 2.0)).expect("ingest");
    assert!(!reordered.dropped_late());
    assert_eq!(reordered.updated, 1);

    let outcome = agg.ingest(&RawMeasurement::new("s1", 1_500, 3.0)).expect("ingest");
    assert_eq!(outcome.closed.len(), 1);
    assert_eq!(outcome.closed[0].stats.count(), 1);
}

#[test]
fn hopping_measurement_can_be_partially_late() {
    let mut agg = WindowedAggregator::new(
        HourOfDayBuckets::new(Tz::UTC),
        WindowSpec::from_millis(3_000, 1_000).expect("window"),
        0,
    );
    agg.ingest(&RawMeasurement::new("s1", 3_600, 1.0)).expect("ingest");
    let outcome = agg.ingest(&RawMeasurement::new("s1", 2_500, 1.0)).expect("ingest");
    assert_eq!(outcome.late, 1);
    assert_eq!(outcome.updated, 2);
    assert!(!outcome.dropped_late());
}

#[test]
fn sensors_and_buckets_get_separate_windows() {
    let mut agg = WindowedAggregator::new(
        HourOfDayBuckets::new(Tz::UTC),
        WindowSpec::days(1, 1).expect("window"),
        0,
    );
    agg.ingest(&RawMeasurement::new("a", 10, 1.0)).expect("ingest");
    agg.ingest(&RawMeasurement::new("b", 20, 1.0)).expect("ingest");
    agg.ingest(&RawMeasurement::new("a", HOUR_MS + 10, 1.0)).expect("ingest");
    assert_eq!(agg.open_windows(), 3);
}

#[test]
fn snapshot_is_read_only_and_drain_empties() {
    let mut agg = utc_hours(1_000);
    agg.ingest(&RawMeasurement::new("s1", 100, 4.0)).expect("ingest");
    agg.ingest(&RawMeasurement::new("s2", 200, 8.0)).expect("ingest");

    let snapshot = agg.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(agg.open_windows(), 2);

    let drained = agg.drain();
    assert_eq!(drained.len(), 2);
    assert_eq!(agg.open_windows(), 0);
    assert!(drained.iter().all(|w| w.stats.count() == 1));
}

#[test]
fn non_finite_measurement_leaves_aggregator_untouched() {
    let mut agg = utc_hours(1_000);
    let err = agg
        .ingest(&RawMeasurement::new("s1", 5_000, f64::NAN))
        .unwrap_err();
    assert!(err.is_malformed_input());
    assert_eq!(agg.open_windows(), 0);
    assert_eq!(agg.watermark_ms(), None);
}

#[test]
fn factories_build_records_from_closed_windows() {
    let bounds = WindowBounds {
        start_ms: 0,
        end_ms: 7 * DAY_MS,
    };
    let stats = StatsAccumulator::from_values([100.0, 300.0]);
    let key = HourOfWeekBuckets::new(Paris)
        .derive_key("s1", ts((2021, 3, 1, 0, 30)))
        .expect("key");
    let strategy = HourOfWeekBuckets::new(Paris);
    let record = HourOfWeekRecords
        .create(strategy.extract_sensor_id(&key), &key, bounds, &stats)
        .expect("record");
    let OutputRecord::HourOfWeek(inner) = &record else {
        panic!("unexpected record {record:?}");
    };
    assert_eq!(inner.sensor_id, "s1");
    assert_eq!(inner.day_of_week, 1);
    assert_eq!(inner.hour_of_day, 1);
    assert_eq!(inner.period_start, bounds.start());
    assert_eq!(inner.period_end, bounds.end());
    assert_eq!(inner.stats.count, 2);
    assert!(approx(inner.stats.mean, 200.0));
    assert!(approx(inner.stats.stddev, 100.0));
    assert_eq!(record.stats().min, 100.0);
    assert_eq!(record.field("count"), Some(ColumnValue::BigInt(2)));
    assert_eq!(record.field("hour_of_day"), Some(ColumnValue::SmallInt(1)));
    assert_eq!(record.field("nope"), None);
}

#[test]
fn factory_rejects_empty_windows_and_foreign_keys() {
    let bounds = WindowBounds {
        start_ms: 0,
        end_ms: DAY_MS,
    };
    let key = DayOfWeekBuckets::new(Paris).derive_key("s1", 0).expect("key");
    let empty = DayOfWeekRecords
        .create("s1", &key, bounds, &StatsAccumulator::new())
        .unwrap_err();
    assert!(matches!(empty, StatsError::EmptyWindow { .. }));
    assert!(empty.is_fatal());

    let mismatch = HourOfDayRecords
        .create("s1", &key, bounds, &StatsAccumulator::from_values([1.0]))
        .unwrap_err();
    assert!(matches!(
        mismatch,
        StatsError::KeyMismatch {
            record_type: RecordType::HourOfDay,
            key_kind: "day-of-week",
        }
    ));
}

#[test]
fn every_record_type_declares_its_unit_columns() {
    assert!(RecordType::DayOfWeek.has_column("day_of_week"));
    assert!(!RecordType::DayOfWeek.has_column("hour_of_day"));
    assert!(RecordType::HourOfWeek.has_column("day_of_week"));
    assert!(RecordType::HourOfWeek.has_column("hour_of_day"));
    for record_type in RecordType::ALL {
        assert_eq!(
            record_type
                .columns()
                .iter()
                .find(|c| c.name == "period_start")
                .map(|c| c.kind),
            Some(ColumnKind::Timestamp)
        );
    }
}

#[test]
fn one_sensor_one_day_yields_a_single_day_of_week_record() {
    let spec = WindowSpec::days(365, 30).expect("window");
    let mut agg = WindowedAggregator::new(DayOfWeekBuckets::new(Paris), spec, 0);
    let monday = ts((2021, 3, 1, 8, 0));
    for (offset, value) in [(0, 10.0), (HOUR_MS, 20.0), (2 * HOUR_MS, 30.0)] {
        agg.ingest(&RawMeasurement::new("s1", monday + offset, value))
            .expect("ingest");
    }

    let windows = agg.drain();
    // 2021-03-01 sits 27 days into its 30-day grid cell: 12 overlapping windows.
    assert_eq!(windows.len(), 12);
    assert_eq!(windows.len(), spec.windows_for(monday).len());
    for window in windows {
        let sensor_id = agg.strategy().extract_sensor_id(&window.key);
        let record = DayOfWeekRecords
            .create(sensor_id, &window.key, window.bounds, &window.stats)
            .expect("record");
        let OutputRecord::DayOfWeek(day) = record else {
            panic!("unexpected record kind");
        };
        assert_eq!(day.sensor_id, "s1");
        assert_eq!(day.day_of_week, 1);
        assert_eq!(day.stats.count, 3);
        assert!(approx(day.stats.mean, 20.0));
        assert_eq!(day.stats.min, 10.0);
        assert_eq!(day.stats.max, 30.0);
    }
}

#[test]
fn accumulator_rebuilt_from_summary_merges_like_the_source() {
    let first = StatsAccumulator::from_values([10.0, 20.0, 30.0]);
    let rebuilt = StatsAccumulator::from_summary(
        first.count(),
        first.mean(),
        first.stddev(),
        first.min(),
        first.max(),
    )
    .expect("summary");
    assert!(approx(rebuilt.variance(), first.variance()));

    let merged = rebuilt.merge(&StatsAccumulator::from_values([40.0]));
    let expected = StatsAccumulator::from_values([10.0, 20.0, 30.0, 40.0]);
    assert_eq!(merged.count(), 4);
    assert!(approx(merged.mean(), expected.mean()));
    assert!(approx(merged.stddev(), expected.stddev()));
    assert_eq!((merged.min(), merged.max()), (10.0, 40.0));

    assert!(StatsAccumulator::from_summary(0, 0.0, 0.0, 0.0, 0.0).is_none());
    assert!(StatsAccumulator::from_summary(2, f64::NAN, 0.0, 1.0, 1.0).is_none());
    assert!(StatsAccumulator::from_summary(2, 1.0, -1.0, 1.0, 1.0).is_none());
    assert!(StatsAccumulator::from_summary(2, 1.0, 0.0, 3.0, 1.0).is_none());
}

#[test]
fn restored_windows_keep_accumulating() {
    let spec = WindowSpec::days(365, 30).expect("window");
    let monday = ts((2021, 3, 1, 8, 0));
    let mut before = WindowedAggregator::new(DayOfWeekBuckets::new(Paris), spec, 0);
    for value in [10.0, 20.0, 30.0] {
        before
            .ingest(&RawMeasurement::new("s1", monday, value))
            .expect("ingest");
    }

    // Round-trip every window through its output record, as a restart does.
    let mut after = WindowedAggregator::new(DayOfWeekBuckets::new(Paris), spec, 0);
    for window in before.drain() {
        let record = DayOfWeekRecords
            .create("s1", &window.key, window.bounds, &window.stats)
            .expect("record");
        let restored = ClosedWindow::from_record(&record).expect("restore");
        assert_eq!(restored.key, window.key);
        assert_eq!(restored.bounds, window.bounds);
        assert!(after.restore(restored));
    }
    assert_eq!(after.open_windows(), 12);

    after
        .ingest(&RawMeasurement::new("s1", monday + HOUR_MS, 40.0))
        .expect("ingest");
    let windows = after.drain();
    assert_eq!(windows.len(), 12);
    for window in windows {
        assert_eq!(window.stats.count(), 4);
        assert!(approx(window.stats.mean(), 25.0));
        assert_eq!(window.stats.max(), 40.0);
    }
}

#[test]
fn restore_refuses_foreign_and_closed_windows() {
    let mut agg = utc_hours(HOUR_MS);
    let key = HourOfDayBuckets::new(Tz::UTC).derive_key("s1", 0).expect("key");
    let stats = StatsAccumulator::from_values([1.0]);

    // Not on this aggregator's hourly grid.
    assert!(!agg.restore(ClosedWindow {
        key: key.clone(),
        bounds: WindowBounds {
            start_ms: 0,
            end_ms: DAY_MS,
        },
        stats,
    }));
    assert!(!agg.restore(ClosedWindow {
        key: key.clone(),
        bounds: WindowBounds {
            start_ms: 0,
            end_ms: HOUR_MS,
        },
        stats: StatsAccumulator::new(),
    }));

    agg.ingest(&RawMeasurement::new("s1", 5 * HOUR_MS, 2.0))
        .expect("ingest");
    assert!(!agg.restore(ClosedWindow {
        key,
        bounds: WindowBounds {
            start_ms: 0,
            end_ms: HOUR_MS,
        },
        stats,
    }));
    assert_eq!(agg.open_windows(), 1);
}

#[test]
fn records_rebuild_from_their_columns() {
    let strategy = HourOfWeekBuckets::new(Paris);
    let key = strategy.derive_key("meter-3", ts((2021, 3, 1, 0, 30))).expect("key");
    let bounds = WindowBounds {
        start_ms: 0,
        end_ms: 7 * DAY_MS,
    };
    let record = HourOfWeekRecords
        .create(
            strategy.extract_sensor_id(&key),
            &key,
            bounds,
            &StatsAccumulator::from_values([5.0, 7.0]),
        )
        .expect("record");
    let columns: Vec<(&str, ColumnValue)> = RecordType::HourOfWeek
        .columns()
        .iter()
        .filter_map(|c| record.field(c.name).map(|v| (c.name, v)))
        .collect();
    let lookup = |name: &str| columns.iter().find(|(n, _)| *n == name).map(|(_, v)| v);

    let rebuilt = OutputRecord::from_fields(RecordType::HourOfWeek, &lookup).expect("rebuild");
    assert_eq!(rebuilt, record);
    assert_eq!(rebuilt.bucket_key(), key);
    assert_eq!(rebuilt.bounds(), bounds);

    let missing = OutputRecord::from_fields(RecordType::HourOfWeek, &|name: &str| {
        if name == "hour_of_day" {
            None
        } else {
            lookup(name)
        }
    })
    .unwrap_err();
    assert!(matches!(
        missing,
        StatsError::CorruptRow {
            table: "hour_of_week_active_power",
            ..
        }
    ));
    assert!(missing.is_fatal());
}
