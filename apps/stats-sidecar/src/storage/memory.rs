use super::schema::{KeySchema, SchemaRegistry};
use super::writer::{StatsStore, StoreRow};
use crate::error::StatsError;
use crate::stats::ColumnValue;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Upserting in-memory store keyed like the SQL tables. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    tables: Mutex<BTreeMap<&'static str, Vec<StoreRow>>>,
    writes: AtomicUsize,
    fail_next: AtomicUsize,
    prepared: AtomicUsize,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a store error.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn rows(&self, table: &str) -> Vec<StoreRow> {
        self.tables
            .lock()
            .map(|tables| tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn prepared_schemas(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

fn period_end_ms(row: &StoreRow) -> Option<i64> {
    match row.field("period_end") {
        Some(ColumnValue::Timestamp(end)) => Some(end.timestamp_millis()),
        _ => None,
    }
}

fn same_key(a: &StoreRow, b: &StoreRow) -> bool {
    let key = |row: &StoreRow| -> Vec<(String, ColumnValue)> { row.key_columns().cloned().collect() };
    key(a) == key(b)
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn prepare(&self, registry: &SchemaRegistry) -> Result<(), StatsError> {
        self.prepared.store(registry.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn write_row(&self, row: &StoreRow) -> Result<(), StatsError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                pending.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(StatsError::Store {
                table: row.table,
                source: "injected store failure".into(),
            });
        }

        let mut tables = self.tables.lock().map_err(|_| StatsError::Store {
            table: row.table,
            source: "memory store lock poisoned".into(),
        })?;
        let rows = tables.entry(row.table).or_default();
        match rows.iter_mut().find(|existing| same_key(existing, row)) {
            Some(existing) => *existing = row.clone(),
            None => rows.push(row.clone()),
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_open(
        &self,
        schema: &KeySchema,
        horizon_ms: i64,
    ) -> Result<Vec<StoreRow>, StatsError> {
        let table = schema.record_type.table_name();
        let rows = self.rows(table);
        let Some(latest) = rows.iter().filter_map(period_end_ms).max() else {
            return Ok(Vec::new());
        };
        let cutoff = latest.saturating_sub(horizon_ms);
        Ok(rows
            .into_iter()
            .filter(|row| period_end_ms(row).is_some_and(|end| end > cutoff))
            .collect())
    }
}
