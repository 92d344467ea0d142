use crate::error::StatsError;
use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::fmt;

/// Calendar-derived grouping key. Two measurements of the same sensor that share the
/// calendar feature always land on the same key, whatever window they fall into.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BucketKey {
    DayOfWeek {
        day_of_week: u8,
        sensor_id: String,
    },
    HourOfDay {
        hour_of_day: u8,
        sensor_id: String,
    },
    HourOfWeek {
        day_of_week: u8,
        hour_of_day: u8,
        sensor_id: String,
    },
}

impl BucketKey {
    pub fn sensor_id(&self) -> &str {
        match self {
            BucketKey::DayOfWeek { sensor_id, .. }
            | BucketKey::HourOfDay { sensor_id, .. }
            | BucketKey::HourOfWeek { sensor_id, .. } => sensor_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BucketKey::DayOfWeek { .. } => "day-of-week",
            BucketKey::HourOfDay { .. } => "hour-of-day",
            BucketKey::HourOfWeek { .. } => "hour-of-week",
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BucketKey::DayOfWeek {
                day_of_week,
                sensor_id,
            } => write!(f, "{sensor_id}@dow{day_of_week}"),
            BucketKey::HourOfDay {
                hour_of_day,
                sensor_id,
            } => write!(f, "{sensor_id}@h{hour_of_day}"),
            BucketKey::HourOfWeek {
                day_of_week,
                hour_of_day,
                sensor_id,
            } => write!(f, "{sensor_id}@dow{day_of_week}h{hour_of_day}"),
        }
    }
}

/// Calendar fields of one instant, localized once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalendarTime {
    /// ISO numbering, Monday = 1 .. Sunday = 7.
    pub day_of_week: u8,
    pub hour_of_day: u8,
}

impl CalendarTime {
    pub fn localize(zone: Tz, sensor_id: &str, timestamp_ms: i64) -> Result<Self, StatsError> {
        let utc = Utc.timestamp_millis_opt(timestamp_ms).single().ok_or_else(|| {
            StatsError::InvalidTimestamp {
                sensor_id: sensor_id.to_string(),
                timestamp_ms,
            }
        })?;
        let local = utc.with_timezone(&zone);
        Ok(Self {
            day_of_week: local.weekday().number_from_monday() as u8,
            hour_of_day: local.hour() as u8,
        })
    }
}

pub trait BucketStrategy: Clone + Send + Sync + 'static {
    fn derive_key(&self, sensor_id: &str, timestamp_ms: i64) -> Result<BucketKey, StatsError>;

    /// Inverse projection used after windowing to recover the sensor identity.
    fn extract_sensor_id<'k>(&self, key: &'k BucketKey) -> &'k str {
        key.sensor_id()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DayOfWeekBuckets {
    zone: Tz,
}

impl DayOfWeekBuckets {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }
}

impl BucketStrategy for DayOfWeekBuckets {
    fn derive_key(&self, sensor_id: &str, timestamp_ms: i64) -> Result<BucketKey, StatsError> {
        let calendar = CalendarTime::localize(self.zone, sensor_id, timestamp_ms)?;
        Ok(BucketKey::DayOfWeek {
            day_of_week: calendar.day_of_week,
            sensor_id: sensor_id.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HourOfDayBuckets {
    zone: Tz,
}

impl HourOfDayBuckets {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }
}

impl BucketStrategy for HourOfDayBuckets {
    fn derive_key(&self, sensor_id: &str, timestamp_ms: i64) -> Result<BucketKey, StatsError> {
        let calendar = CalendarTime::localize(self.zone, sensor_id, timestamp_ms)?;
        Ok(BucketKey::HourOfDay {
            hour_of_day: calendar.hour_of_day,
            sensor_id: sensor_id.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HourOfWeekBuckets {
    zone: Tz,
}

impl HourOfWeekBuckets {
    pub fn new(zone: Tz) -> Self {
        Self { zone }
    }
}

impl BucketStrategy for HourOfWeekBuckets {
    fn derive_key(&self, sensor_id: &str, timestamp_ms: i64) -> Result<BucketKey, StatsError> {
        let calendar = CalendarTime::localize(self.zone, sensor_id, timestamp_ms)?;
        Ok(BucketKey::HourOfWeek {
            day_of_week: calendar.day_of_week,
            hour_of_day: calendar.hour_of_day,
            sensor_id: sensor_id.to_string(),
        })
    }
}
