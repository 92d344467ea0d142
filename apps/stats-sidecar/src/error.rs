use crate::stats::RecordType;
use crate::storage::KeySchema;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("key schema for {record_type} registered twice with different fields (registered {registered}, attempted {attempted})")]
    SchemaConflict {
        record_type: RecordType,
        registered: KeySchema,
        attempted: KeySchema,
    },

    #[error("key schema for {record_type} is invalid: {reason}")]
    InvalidSchema {
        record_type: RecordType,
        reason: String,
    },

    #[error("no key schema registered for {0}")]
    UnresolvedSchema(RecordType),

    #[error("{record_type} has no field named {field}")]
    UnknownField {
        record_type: RecordType,
        field: String,
    },

    #[error("non-finite measurement value {value} from sensor {sensor_id}")]
    NonFiniteValue { sensor_id: String, value: f64 },

    #[error("timestamp {timestamp_ms} from sensor {sensor_id} is out of range")]
    InvalidTimestamp {
        sensor_id: String,
        timestamp_ms: i64,
    },

    #[error("window for {record_type} closed with zero observations")]
    EmptyWindow { record_type: RecordType },

    #[error("{record_type} factory cannot build a record from a {key_kind} key")]
    KeyMismatch {
        record_type: RecordType,
        key_kind: &'static str,
    },

    #[error("stats row in {table} cannot be restored: {reason}")]
    CorruptRow { table: &'static str, reason: String },

    #[error("store call on {table} failed: {source}")]
    Store {
        table: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl StatsError {
    /// Malformed input: the measurement is dropped and counted, processing continues.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            StatsError::NonFiniteValue { .. } | StatsError::InvalidTimestamp { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StatsError::Store { .. })
    }

    /// Errors that halt the owning pipeline instead of being absorbed.
    pub fn is_fatal(&self) -> bool {
        !self.is_malformed_input() && !self.is_retryable()
    }
}
