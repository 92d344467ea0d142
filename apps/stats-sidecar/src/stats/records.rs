use super::accumulator::StatsAccumulator;
use super::bucket::BucketKey;
use super::window::WindowBounds;
use crate::error::StatsError;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
    DayOfWeek,
    HourOfDay,
    HourOfWeek,
}

impl RecordType {
    pub const ALL: [RecordType; 3] = [
        RecordType::DayOfWeek,
        RecordType::HourOfDay,
        RecordType::HourOfWeek,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::DayOfWeek => "day_of_week",
            RecordType::HourOfDay => "hour_of_day",
            RecordType::HourOfWeek => "hour_of_week",
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            RecordType::DayOfWeek => "day_of_week_active_power",
            RecordType::HourOfDay => "hour_of_day_active_power",
            RecordType::HourOfWeek => "hour_of_week_active_power",
        }
    }

    pub fn columns(self) -> &'static [ColumnDef] {
        match self {
            RecordType::DayOfWeek => DAY_OF_WEEK_COLUMNS,
            RecordType::HourOfDay => HOUR_OF_DAY_COLUMNS,
            RecordType::HourOfWeek => HOUR_OF_WEEK_COLUMNS,
        }
    }

    pub fn has_column(self, name: &str) -> bool {
        self.columns().iter().any(|column| column.name == name)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    SmallInt,
    BigInt,
    Double,
    Timestamp,
}

#[derive(Clone, Copy, Debug)]
pub struct ColumnDef {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn column(name: &'static str, kind: ColumnKind) -> ColumnDef {
    ColumnDef { name, kind }
}

const DAY_OF_WEEK_COLUMNS: &[ColumnDef] = &[
    column("sensor_id", ColumnKind::Text),
    column("day_of_week", ColumnKind::SmallInt),
    column("period_start", ColumnKind::Timestamp),
    column("period_end", ColumnKind::Timestamp),
    column("count", ColumnKind::BigInt),
    column("mean", ColumnKind::Double),
    column("stddev", ColumnKind::Double),
    column("min", ColumnKind::Double),
    column("max", ColumnKind::Double),
];

const HOUR_OF_DAY_COLUMNS: &[ColumnDef] = &[
    column("sensor_id", ColumnKind::Text),
    column("hour_of_day", ColumnKind::SmallInt),
    column("period_start", ColumnKind::Timestamp),
    column("period_end", ColumnKind::Timestamp),
    column("count", ColumnKind::BigInt),
    column("mean", ColumnKind::Double),
    column("stddev", ColumnKind::Double),
    column("min", ColumnKind::Double),
    column("max", ColumnKind::Double),
];

const HOUR_OF_WEEK_COLUMNS: &[ColumnDef] = &[
    column("sensor_id", ColumnKind::Text),
    column("day_of_week", ColumnKind::SmallInt),
    column("hour_of_day", ColumnKind::SmallInt),
    column("period_start", ColumnKind::Timestamp),
    column("period_end", ColumnKind::Timestamp),
    column("count", ColumnKind::BigInt),
    column("mean", ColumnKind::Double),
    column("stddev", ColumnKind::Double),
    column("min", ColumnKind::Double),
    column("max", ColumnKind::Double),
];

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Text(String),
    SmallInt(i16),
    BigInt(i64),
    Double(f64),
    Timestamp(DateTime<Utc>),
}

/// Final statistics of one window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsSummary {
    pub count: i64,
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
    pub max: f64,
}

impl StatsSummary {
    fn from_accumulator(
        record_type: RecordType,
        stats: &StatsAccumulator,
    ) -> Result<Self, StatsError> {
        if stats.is_empty() {
            return Err(StatsError::EmptyWindow { record_type });
        }
        Ok(Self {
            count: stats.count(),
            mean: stats.mean(),
            stddev: stats.stddev(),
            min: stats.min(),
            max: stats.max(),
        })
    }

    /// Accumulator whose summary equals this one.
    pub fn to_accumulator(&self, record_type: RecordType) -> Result<StatsAccumulator, StatsError> {
        StatsAccumulator::from_summary(self.count, self.mean, self.stddev, self.min, self.max)
            .ok_or_else(|| StatsError::CorruptRow {
                table: record_type.table_name(),
                reason: format!("inconsistent statistics {self:?}"),
            })
    }

    fn field(&self, name: &str) -> Option<ColumnValue> {
        let value = match name {
            "count" => ColumnValue::BigInt(self.count),
            "mean" => ColumnValue::Double(self.mean),
            "stddev" => ColumnValue::Double(self.stddev),
            "min" => ColumnValue::Double(self.min),
            "max" => ColumnValue::Double(self.max),
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DayOfWeekRecord {
    pub sensor_id: String,
    pub day_of_week: u8,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub stats: StatsSummary,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HourOfDayRecord {
    pub sensor_id: String,
    pub hour_of_day: u8,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub stats: StatsSummary,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HourOfWeekRecord {
    pub sensor_id: String,
    pub day_of_week: u8,
    pub hour_of_day: u8,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub stats: StatsSummary,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputRecord {
    DayOfWeek(DayOfWeekRecord),
    HourOfDay(HourOfDayRecord),
    HourOfWeek(HourOfWeekRecord),
}

impl OutputRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            OutputRecord::DayOfWeek(_) => RecordType::DayOfWeek,
            OutputRecord::HourOfDay(_) => RecordType::HourOfDay,
            OutputRecord::HourOfWeek(_) => RecordType::HourOfWeek,
        }
    }

    pub fn sensor_id(&self) -> &str {
        match self {
            OutputRecord::DayOfWeek(r) => &r.sensor_id,
            OutputRecord::HourOfDay(r) => &r.sensor_id,
            OutputRecord::HourOfWeek(r) => &r.sensor_id,
        }
    }

    pub fn stats(&self) -> &StatsSummary {
        match self {
            OutputRecord::DayOfWeek(r) => &r.stats,
            OutputRecord::HourOfDay(r) => &r.stats,
            OutputRecord::HourOfWeek(r) => &r.stats,
        }
    }

    pub fn period(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            OutputRecord::DayOfWeek(r) => (r.period_start, r.period_end),
            OutputRecord::HourOfDay(r) => (r.period_start, r.period_end),
            OutputRecord::HourOfWeek(r) => (r.period_start, r.period_end),
        }
    }

    pub fn bounds(&self) -> WindowBounds {
        let (start, end) = self.period();
        WindowBounds {
            start_ms: start.timestamp_millis(),
            end_ms: end.timestamp_millis(),
        }
    }

    /// Bucket key the record was built from.
    pub fn bucket_key(&self) -> BucketKey {
        match self {
            OutputRecord::DayOfWeek(r) => BucketKey::DayOfWeek {
                day_of_week: r.day_of_week,
                sensor_id: r.sensor_id.clone(),
            },
            OutputRecord::HourOfDay(r) => BucketKey::HourOfDay {
                hour_of_day: r.hour_of_day,
                sensor_id: r.sensor_id.clone(),
            },
            OutputRecord::HourOfWeek(r) => BucketKey::HourOfWeek {
                day_of_week: r.day_of_week,
                hour_of_day: r.hour_of_day,
                sensor_id: r.sensor_id.clone(),
            },
        }
    }

    /// Inverse of [`OutputRecord::field`]: rebuilds a record from its named columns.
    pub fn from_fields<'a>(
        record_type: RecordType,
        lookup: &dyn Fn(&str) -> Option<&'a ColumnValue>,
    ) -> Result<Self, StatsError> {
        let read = FieldReader {
            record_type,
            lookup,
        };
        let sensor_id = read.text("sensor_id")?;
        let period_start = read.timestamp("period_start")?;
        let period_end = read.timestamp("period_end")?;
        let stats = StatsSummary {
            count: read.bigint("count")?,
            mean: read.double("mean")?,
            stddev: read.double("stddev")?,
            min: read.double("min")?,
            max: read.double("max")?,
        };
        let record = match record_type {
            RecordType::DayOfWeek => OutputRecord::DayOfWeek(DayOfWeekRecord {
                sensor_id,
                day_of_week: read.unit("day_of_week")?,
                period_start,
                period_end,
                stats,
            }),
            RecordType::HourOfDay => OutputRecord::HourOfDay(HourOfDayRecord {
                sensor_id,
                hour_of_day: read.unit("hour_of_day")?,
                period_start,
                period_end,
                stats,
            }),
            RecordType::HourOfWeek => OutputRecord::HourOfWeek(HourOfWeekRecord {
                sensor_id,
                day_of_week: read.unit("day_of_week")?,
                hour_of_day: read.unit("hour_of_day")?,
                period_start,
                period_end,
                stats,
            }),
        };
        Ok(record)
    }

    /// Field-name accessor used by the generic storage writer.
    pub fn field(&self, name: &str) -> Option<ColumnValue> {
        match self {
            OutputRecord::DayOfWeek(r) => match name {
                "sensor_id" => Some(ColumnValue::Text(r.sensor_id.clone())),
                "day_of_week" => Some(ColumnValue::SmallInt(i16::from(r.day_of_week))),
                "period_start" => Some(ColumnValue::Timestamp(r.period_start)),
                "period_end" => Some(ColumnValue::Timestamp(r.period_end)),
                other => r.stats.field(other),
            },
            OutputRecord::HourOfDay(r) => match name {
                "sensor_id" => Some(ColumnValue::Text(r.sensor_id.clone())),
                "hour_of_day" => Some(ColumnValue::SmallInt(i16::from(r.hour_of_day))),
                "period_start" => Some(ColumnValue::Timestamp(r.period_start)),
                "period_end" => Some(ColumnValue::Timestamp(r.period_end)),
                other => r.stats.field(other),
            },
            OutputRecord::HourOfWeek(r) => match name {
                "sensor_id" => Some(ColumnValue::Text(r.sensor_id.clone())),
                "day_of_week" => Some(ColumnValue::SmallInt(i16::from(r.day_of_week))),
                "hour_of_day" => Some(ColumnValue::SmallInt(i16::from(r.hour_of_day))),
                "period_start" => Some(ColumnValue::Timestamp(r.period_start)),
                "period_end" => Some(ColumnValue::Timestamp(r.period_end)),
                other => r.stats.field(other),
            },
        }
    }
}

struct FieldReader<'r, 'a> {
    record_type: RecordType,
    lookup: &'r dyn Fn(&str) -> Option<&'a ColumnValue>,
}

impl<'a> FieldReader<'_, 'a> {
    fn corrupt(&self, reason: String) -> StatsError {
        StatsError::CorruptRow {
            table: self.record_type.table_name(),
            reason,
        }
    }

    fn get(&self, name: &str) -> Result<&'a ColumnValue, StatsError> {
        (self.lookup)(name).ok_or_else(|| self.corrupt(format!("missing column {name}")))
    }

    fn unexpected(&self, name: &str, found: &ColumnValue) -> StatsError {
        self.corrupt(format!("column {name} holds {found:?}"))
    }

    fn text(&self, name: &str) -> Result<String, StatsError> {
        match self.get(name)? {
            ColumnValue::Text(v) => Ok(v.clone()),
            other => Err(self.unexpected(name, other)),
        }
    }

    fn unit(&self, name: &str) -> Result<u8, StatsError> {
        match self.get(name)? {
            ColumnValue::SmallInt(v) => u8::try_from(*v)
                .map_err(|_| self.corrupt(format!("column {name} holds unit {v} out of range"))),
            other => Err(self.unexpected(name, other)),
        }
    }

    fn bigint(&self, name: &str) -> Result<i64, StatsError> {
        match self.get(name)? {
            ColumnValue::BigInt(v) => Ok(*v),
            other => Err(self.unexpected(name, other)),
        }
    }

    fn double(&self, name: &str) -> Result<f64, StatsError> {
        match self.get(name)? {
            ColumnValue::Double(v) => Ok(*v),
            other => Err(self.unexpected(name, other)),
        }
    }

    fn timestamp(&self, name: &str) -> Result<DateTime<Utc>, StatsError> {
        match self.get(name)? {
            ColumnValue::Timestamp(v) => Ok(*v),
            other => Err(self.unexpected(name, other)),
        }
    }
}

/// Builds the output record of one closed window. `sensor_id` is the one the bucket
/// strategy recovers from `key`.
pub trait RecordFactory: Send + Sync + 'static {
    fn record_type(&self) -> RecordType;

    fn create(
        &self,
        sensor_id: &str,
        key: &BucketKey,
        bounds: WindowBounds,
        stats: &StatsAccumulator,
    ) -> Result<OutputRecord, StatsError>;

    fn mismatch(&self, key: &BucketKey) -> StatsError {
        StatsError::KeyMismatch {
            record_type: self.record_type(),
            key_kind: key.kind(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DayOfWeekRecords;

impl RecordFactory for DayOfWeekRecords {
    fn record_type(&self) -> RecordType {
        RecordType::DayOfWeek
    }

    fn create(
        &self,
        sensor_id: &str,
        key: &BucketKey,
        bounds: WindowBounds,
        stats: &StatsAccumulator,
    ) -> Result<OutputRecord, StatsError> {
        let BucketKey::DayOfWeek { day_of_week, .. } = key
        else {
            return Err(self.mismatch(key));
        };
        Ok(OutputRecord::DayOfWeek(DayOfWeekRecord {
            sensor_id: sensor_id.to_string(),
            day_of_week: *day_of_week,
            period_start: bounds.start(),
            period_end: bounds.end(),
            stats: StatsSummary::from_accumulator(self.record_type(), stats)?,
        }))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HourOfDayRecords;

impl RecordFactory for HourOfDayRecords {
    fn record_type(&self) -> RecordType {
        RecordType::HourOfDay
    }

    fn create(
        &self,
        sensor_id: &str,
        key: &BucketKey,
        bounds: WindowBounds,
        stats: &StatsAccumulator,
    ) -> Result<OutputRecord, StatsError> {
        let BucketKey::HourOfDay { hour_of_day, .. } = key
        else {
            return Err(self.mismatch(key));
        };
        Ok(OutputRecord::HourOfDay(HourOfDayRecord {
            sensor_id: sensor_id.to_string(),
            hour_of_day: *hour_of_day,
            period_start: bounds.start(),
            period_end: bounds.end(),
            stats: StatsSummary::from_accumulator(self.record_type(), stats)?,
        }))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HourOfWeekRecords;

impl RecordFactory for HourOfWeekRecords {
    fn record_type(&self) -> RecordType {
        RecordType::HourOfWeek
    }

    fn create(
        &self,
        sensor_id: &str,
        key: &BucketKey,
        bounds: WindowBounds,
        stats: &StatsAccumulator,
    ) -> Result<OutputRecord, StatsError> {
        let BucketKey::HourOfWeek {
            day_of_week,
            hour_of_day,
            ..
        } = key
        else {
            return Err(self.mismatch(key));
        };
        Ok(OutputRecord::HourOfWeek(HourOfWeekRecord {
            sensor_id: sensor_id.to_string(),
            day_of_week: *day_of_week,
            hour_of_day: *hour_of_day,
            period_start: bounds.start(),
            period_end: bounds.end(),
            stats: StatsSummary::from_accumulator(self.record_type(), stats)?,
        }))
    }
}
