use crate::error::StatsError;
use crate::stats::RecordType;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Partition and clustering layout one record type is written with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySchema {
    pub record_type: RecordType,
    pub partition_fields: Vec<String>,
    pub clustering_fields: Vec<String>,
}

impl KeySchema {
    pub fn new<P, C>(record_type: RecordType, partition_fields: P, clustering_fields: C) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        C: IntoIterator,
        C::Item: Into<String>,
    {
        Self {
            record_type,
            partition_fields: partition_fields.into_iter().map(Into::into).collect(),
            clustering_fields: clustering_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The layout each output table is declared with: the sensor partitions, the period
    /// and calendar unit cluster.
    pub fn declared(record_type: RecordType) -> Self {
        let unit_fields: &[&str] = match record_type {
            RecordType::DayOfWeek => &["day_of_week"],
            RecordType::HourOfDay => &["hour_of_day"],
            RecordType::HourOfWeek => &["day_of_week", "hour_of_day"],
        };
        let clustering = ["period_start", "period_end"]
            .iter()
            .chain(unit_fields.iter())
            .copied();
        Self::new(record_type, ["sensor_id"], clustering)
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &str> {
        self.partition_fields
            .iter()
            .chain(self.clustering_fields.iter())
            .map(String::as_str)
    }

    pub fn is_key_field(&self, name: &str) -> bool {
        self.key_fields().any(|field| field == name)
    }

    fn validate(&self) -> Result<(), StatsError> {
        let invalid = |reason: String| StatsError::InvalidSchema {
            record_type: self.record_type,
            reason,
        };
        if self.partition_fields.is_empty() {
            return Err(invalid("at least one partition field is required".into()));
        }
        let mut seen = HashSet::new();
        for field in self.key_fields() {
            if !seen.insert(field) {
                return Err(invalid(format!("field {field} appears more than once")));
            }
            if !self.record_type.has_column(field) {
                return Err(StatsError::UnknownField {
                    record_type: self.record_type,
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for KeySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(({}), {})",
            self.partition_fields.join(", "),
            self.clustering_fields.join(", ")
        )
    }
}

/// Startup-time registration. Append-only; turned into a read-only [`SchemaRegistry`]
/// before any pipeline runs.
#[derive(Debug, Default)]
pub struct SchemaRegistryBuilder {
    schemas: HashMap<RecordType, KeySchema>,
}

impl SchemaRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent for identical schemas; a different schema for a registered type fails.
    pub fn register(&mut self, schema: KeySchema) -> Result<&mut Self, StatsError> {
        schema.validate()?;
        match self.schemas.get(&schema.record_type) {
            Some(existing) if *existing == schema => {
                tracing::debug!(record_type = %schema.record_type, "key schema already registered");
            }
            Some(existing) => {
                return Err(StatsError::SchemaConflict {
                    record_type: schema.record_type,
                    registered: existing.clone(),
                    attempted: schema,
                });
            }
            None => {
                tracing::info!(
                    record_type = %schema.record_type,
                    partition = ?schema.partition_fields,
                    clustering = ?schema.clustering_fields,
                    "registered key schema"
                );
                self.schemas.insert(schema.record_type, schema);
            }
        }
        Ok(self)
    }

    pub fn build(self) -> SchemaRegistry {
        SchemaRegistry {
            schemas: self.schemas,
        }
    }
}

/// Read-only record type -> key schema mapping, shared across workers without locking.
#[derive(Debug)]
pub struct SchemaRegistry {
    schemas: HashMap<RecordType, KeySchema>,
}

impl SchemaRegistry {
    pub fn resolve(&self, record_type: RecordType) -> Result<&KeySchema, StatsError> {
        self.schemas
            .get(&record_type)
            .ok_or(StatsError::UnresolvedSchema(record_type))
    }

    pub fn schemas(&self) -> impl Iterator<Item = &KeySchema> {
        self.schemas.values()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
