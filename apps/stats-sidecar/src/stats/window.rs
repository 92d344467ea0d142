use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

/// Half-open `[start_ms, end_ms)` window instance on the epoch-aligned grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowBounds {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl WindowBounds {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.start_ms <= timestamp_ms && timestamp_ms < self.end_ms
    }

    pub fn start(&self) -> DateTime<Utc> {
        millis_to_dt(self.start_ms)
    }

    pub fn end(&self) -> DateTime<Utc> {
        millis_to_dt(self.end_ms)
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start().to_rfc3339(), self.end().to_rfc3339())
    }
}

/// Tumbling (`advance == size`) or hopping (`advance < size`) window definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSpec {
    size_ms: i64,
    advance_ms: i64,
}

impl WindowSpec {
    pub fn new(size: Duration, advance: Duration) -> Result<Self, String> {
        let size_ms = i64::try_from(size.as_millis())
            .map_err(|_| format!("window size {size:?} is too large"))?;
        let advance_ms = i64::try_from(advance.as_millis())
            .map_err(|_| format!("window advance {advance:?} is too large"))?;
        Self::from_millis(size_ms, advance_ms)
    }

    pub fn from_millis(size_ms: i64, advance_ms: i64) -> Result<Self, String> {
        if size_ms <= 0 {
            return Err(format!("window size must be positive, got {size_ms}ms"));
        }
        if advance_ms <= 0 {
            return Err(format!("window advance must be positive, got {advance_ms}ms"));
        }
        if advance_ms > size_ms {
            return Err(format!(
                "window advance {advance_ms}ms must not exceed window size {size_ms}ms"
            ));
        }
        Ok(Self {
            size_ms,
            advance_ms,
        })
    }

    pub fn tumbling(size: Duration) -> Result<Self, String> {
        Self::new(size, size)
    }

    pub fn days(size_days: u64, advance_days: u64) -> Result<Self, String> {
        const DAY: u64 = 24 * 60 * 60;
        Self::new(
            Duration::from_secs(size_days.saturating_mul(DAY)),
            Duration::from_secs(advance_days.saturating_mul(DAY)),
        )
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    pub fn advance_ms(&self) -> i64 {
        self.advance_ms
    }

    pub fn is_tumbling(&self) -> bool {
        self.size_ms == self.advance_ms
    }

    /// Every window instance containing `timestamp_ms`, oldest first. Starts are
    /// multiples of `advance`, so the grid does not depend on the first measurement.
    pub fn windows_for(&self, timestamp_ms: i64) -> Vec<WindowBounds> {
        let last_start = align_down(timestamp_ms, self.advance_ms);
        let mut windows = Vec::with_capacity((self.size_ms / self.advance_ms + 1) as usize);
        let mut start = last_start;
        while start > timestamp_ms.saturating_sub(self.size_ms) {
            windows.push(WindowBounds {
                start_ms: start,
                end_ms: start.saturating_add(self.size_ms),
            });
            start = match start.checked_sub(self.advance_ms) {
                Some(next) => next,
                None => break,
            };
        }
        windows.reverse();
        windows
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size={}ms advance={}ms", self.size_ms, self.advance_ms)
    }
}

fn align_down(timestamp_ms: i64, interval_ms: i64) -> i64 {
    timestamp_ms.div_euclid(interval_ms) * interval_ms
}

pub(crate) fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
