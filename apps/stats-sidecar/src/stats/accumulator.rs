use crate::error::StatsError;

/// Running count/mean/variance/min/max over one window, updated with Welford's
/// online algorithm and mergeable with Chan's parallel combination.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsAccumulator {
    count: i64,
    mean: f64,
    sum_squared_deviation: f64,
    min: f64,
    max: f64,
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            sum_squared_deviation: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = f64>,
    {
        let mut acc = Self::new();
        for value in values.into_iter().filter(|v| v.is_finite()) {
            acc.fold(value);
        }
        acc
    }

    /// Rebuilds an accumulator from persisted summary statistics. `stddev` is the
    /// population deviation, so the sum of squared deviations is `stddev² · count`.
    /// Returns `None` for summaries no sequence of finite values could produce.
    pub fn from_summary(
        count: i64,
        mean: f64,
        stddev: f64,
        min: f64,
        max: f64,
    ) -> Option<Self> {
        let finite = [mean, stddev, min, max].iter().all(|v| v.is_finite());
        if count <= 0 || !finite || stddev < 0.0 || min > max {
            return None;
        }
        Some(Self {
            count,
            mean,
            sum_squared_deviation: stddev * stddev * count as f64,
            min,
            max,
        })
    }

    pub fn accumulate(&mut self, sensor_id: &str, value: f64) -> Result<(), StatsError> {
        ensure_finite(sensor_id, value)?;
        self.fold(value);
        Ok(())
    }

    fn fold(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.sum_squared_deviation += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Combines two accumulators into the accumulator of their concatenated inputs.
    pub fn merge(&self, other: &StatsAccumulator) -> StatsAccumulator {
        if self.count == 0 {
            return *other;
        }
        if other.count == 0 {
            return *self;
        }
        let count = self.count + other.count;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * (other.count as f64 / count as f64);
        let sum_squared_deviation = self.sum_squared_deviation
            + other.sum_squared_deviation
            + delta * delta * (self.count as f64 * other.count as f64 / count as f64);
        StatsAccumulator {
            count,
            mean,
            sum_squared_deviation,
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; zero for an empty accumulator.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.sum_squared_deviation / self.count as f64).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

pub(crate) fn ensure_finite(sensor_id: &str, value: f64) -> Result<(), StatsError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(StatsError::NonFiniteValue {
            sensor_id: sensor_id.to_string(),
            value,
        })
    }
}
