use super::schema::{KeySchema, SchemaRegistry};
use super::writer::{StatsStore, StoreRow};
use crate::error::StatsError;
use crate::stats::{ColumnDef, ColumnKind, ColumnValue, OutputRecord, RecordType};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Instant;

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Writes each record type into its own table. The primary key is the partition fields
/// followed by the clustering fields, and every write is an upsert on that key.
#[derive(Clone)]
pub struct PgStatsStore {
    pool: PgPool,
}

impl PgStatsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text => "TEXT",
        ColumnKind::SmallInt => "SMALLINT",
        ColumnKind::BigInt => "BIGINT",
        ColumnKind::Double => "DOUBLE PRECISION",
        ColumnKind::Timestamp => "TIMESTAMPTZ",
    }
}

pub(crate) fn create_table_sql(schema: &KeySchema) -> String {
    let record_type = schema.record_type;
    let mut columns: Vec<String> = record_type
        .columns()
        .iter()
        .map(|column| format!("{} {} NOT NULL", quote(column.name), sql_type(column.kind)))
        .collect();
    let key: Vec<String> = schema.key_fields().map(quote).collect();
    columns.push(format!("PRIMARY KEY ({})", key.join(", ")));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(record_type.table_name()),
        columns.join(",\n    ")
    )
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, value: &ColumnValue) {
    match value {
        ColumnValue::Text(v) => builder.push_bind(v.clone()),
        ColumnValue::SmallInt(v) => builder.push_bind(*v),
        ColumnValue::BigInt(v) => builder.push_bind(*v),
        ColumnValue::Double(v) => builder.push_bind(*v),
        ColumnValue::Timestamp(v) => builder.push_bind(*v),
    };
}

pub(crate) fn upsert_query(row: &StoreRow) -> QueryBuilder<'static, Postgres> {
    let names: Vec<String> = row.columns().map(|(name, _)| quote(name)).collect();
    let mut builder: QueryBuilder<'static, Postgres> = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) VALUES (",
        quote(row.table),
        names.join(", ")
    ));
    for (idx, (_, value)) in row.columns().enumerate() {
        if idx > 0 {
            builder.push(", ");
        }
        push_value(&mut builder, value);
    }

    let key: Vec<String> = row.key_columns().map(|(name, _)| quote(name)).collect();
    builder.push(format!(") ON CONFLICT ({}) ", key.join(", ")));
    if row.values.is_empty() {
        builder.push("DO NOTHING");
    } else {
        let updates: Vec<String> = row
            .values
            .iter()
            .map(|(name, _)| format!("{0} = EXCLUDED.{0}", quote(name)))
            .collect();
        builder.push(format!("DO UPDATE SET {}", updates.join(", ")));
    }
    builder
}

/// Rows ending within `$1` seconds of the newest `period_end` in the table.
pub(crate) fn load_open_sql(record_type: RecordType) -> String {
    let table = quote(record_type.table_name());
    let names: Vec<String> = record_type
        .columns()
        .iter()
        .map(|column| quote(column.name))
        .collect();
    format!(
        "SELECT {names} FROM {table} WHERE \"period_end\" > \
         (SELECT MAX(\"period_end\") FROM {table}) - make_interval(secs => $1)",
        names = names.join(", "),
    )
}

fn decode_column(row: &PgRow, column: &ColumnDef) -> Result<ColumnValue, sqlx::Error> {
    let name = column.name;
    let value = match column.kind {
        ColumnKind::Text => ColumnValue::Text(row.try_get(name)?),
        ColumnKind::SmallInt => ColumnValue::SmallInt(row.try_get(name)?),
        ColumnKind::BigInt => ColumnValue::BigInt(row.try_get(name)?),
        ColumnKind::Double => ColumnValue::Double(row.try_get(name)?),
        ColumnKind::Timestamp => ColumnValue::Timestamp(row.try_get(name)?),
    };
    Ok(value)
}

#[async_trait]
impl StatsStore for PgStatsStore {
    async fn prepare(&self, registry: &SchemaRegistry) -> Result<(), StatsError> {
        for schema in registry.schemas() {
            let table = schema.record_type.table_name();
            sqlx::query(&create_table_sql(schema))
                .execute(&self.pool)
                .await
                .map_err(|err| StatsError::Store {
                    table,
                    source: Box::new(err),
                })?;
            tracing::info!(table, key = %schema, "ensured stats table");
        }
        Ok(())
    }

    async fn write_row(&self, row: &StoreRow) -> Result<(), StatsError> {
        let started = Instant::now();
        let mut builder = upsert_query(row);
        builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|err| StatsError::Store {
                table: row.table,
                source: Box::new(err),
            })?;
        tracing::trace!(
            table = row.table,
            micros = started.elapsed().as_micros() as u64,
            "upserted stats row"
        );
        Ok(())
    }

    async fn load_open(
        &self,
        schema: &KeySchema,
        horizon_ms: i64,
    ) -> Result<Vec<StoreRow>, StatsError> {
        let record_type = schema.record_type;
        let table = record_type.table_name();
        let store_error = |err: sqlx::Error| StatsError::Store {
            table,
            source: Box::new(err),
        };
        let rows = sqlx::query(&load_open_sql(record_type))
            .bind(horizon_ms as f64 / 1000.0)
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;

        let mut restored = Vec::with_capacity(rows.len());
        for row in &rows {
            let columns = record_type
                .columns()
                .iter()
                .map(|column| decode_column(row, column).map(|value| (column.name, value)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_error)?;
            let lookup = |name: &str| {
                columns
                    .iter()
                    .find(|(column, _)| *column == name)
                    .map(|(_, value)| value)
            };
            let record = OutputRecord::from_fields(record_type, &lookup)?;
            restored.push(StoreRow::from_record(schema, &record)?);
        }
        tracing::debug!(table, rows = restored.len(), "loaded open stats rows");
        Ok(restored)
    }
}
