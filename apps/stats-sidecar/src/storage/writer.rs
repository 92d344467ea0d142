use super::schema::{KeySchema, SchemaRegistry};
use crate::error::StatsError;
use crate::stats::{ColumnValue, OutputRecord, RecordType};
use async_trait::async_trait;
use std::sync::Arc;

/// One row ready for the store, with key columns already separated out.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreRow {
    pub record_type: RecordType,
    pub table: &'static str,
    pub partition_key: Vec<(String, ColumnValue)>,
    pub clustering_key: Vec<(String, ColumnValue)>,
    pub values: Vec<(String, ColumnValue)>,
}

impl StoreRow {
    pub fn from_record(schema: &KeySchema, record: &OutputRecord) -> Result<Self, StatsError> {
        let record_type = record.record_type();
        let extract = |name: &str| {
            record
                .field(name)
                .map(|value| (name.to_string(), value))
                .ok_or_else(|| StatsError::UnknownField {
                    record_type,
                    field: name.to_string(),
                })
        };

        let partition_key = schema
            .partition_fields
            .iter()
            .map(|name| extract(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let clustering_key = schema
            .clustering_fields
            .iter()
            .map(|name| extract(name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let values = record_type
            .columns()
            .iter()
            .filter(|column| !schema.is_key_field(column.name))
            .map(|column| extract(column.name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            record_type,
            table: record_type.table_name(),
            partition_key,
            clustering_key,
            values,
        })
    }

    pub fn key_columns(&self) -> impl Iterator<Item = &(String, ColumnValue)> {
        self.partition_key.iter().chain(self.clustering_key.iter())
    }

    pub fn columns(&self) -> impl Iterator<Item = &(String, ColumnValue)> {
        self.key_columns().chain(self.values.iter())
    }

    pub fn field(&self, name: &str) -> Option<&ColumnValue> {
        self.columns()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    /// Rebuilds the output record a stored row was written from.
    pub fn to_record(&self) -> Result<OutputRecord, StatsError> {
        OutputRecord::from_fields(self.record_type, &|name| self.field(name))
    }
}

/// Write contract of the external keyed store. Implementations must tolerate concurrent
/// calls from several workers.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Called once at startup after every key schema is registered.
    async fn prepare(&self, _registry: &SchemaRegistry) -> Result<(), StatsError> {
        Ok(())
    }

    async fn write_row(&self, row: &StoreRow) -> Result<(), StatsError>;

    /// Rows whose window could still have been open when the previous run stopped:
    /// every row of the schema's table ending within `horizon_ms` of the latest stored
    /// `period_end`. Used to seed the aggregators on startup.
    async fn load_open(
        &self,
        schema: &KeySchema,
        horizon_ms: i64,
    ) -> Result<Vec<StoreRow>, StatsError>;
}

/// Generic writer: resolves the record's key schema, extracts the named key fields and
/// hands one row to the store. Does not retry.
#[derive(Clone)]
pub struct StatsWriter {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn StatsStore>,
}

impl StatsWriter {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn StatsStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub async fn write(&self, record: &OutputRecord) -> Result<(), StatsError> {
        let schema = self.registry.resolve(record.record_type())?;
        let row = StoreRow::from_record(schema, record)?;
        tracing::trace!(
            table = row.table,
            sensor = %record.sensor_id(),
            "writing stats row"
        );
        self.store.write_row(&row).await
    }
}
