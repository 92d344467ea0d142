mod accumulator;
mod bucket;
mod engine;
mod records;
mod window;

#[cfg(test)]
mod tests;

pub use accumulator::StatsAccumulator;
pub use bucket::{
    BucketKey, BucketStrategy, CalendarTime, DayOfWeekBuckets, HourOfDayBuckets,
    HourOfWeekBuckets,
};
pub use engine::{ClosedWindow, IngestOutcome, WindowedAggregator};
pub use records::{
    ColumnDef, ColumnKind, ColumnValue, DayOfWeekRecord, DayOfWeekRecords, HourOfDayRecord,
    HourOfDayRecords, HourOfWeekRecord, HourOfWeekRecords, OutputRecord, RecordFactory,
    RecordType, StatsSummary,
};
pub use window::{WindowBounds, WindowSpec};
