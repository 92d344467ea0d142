mod memory;
mod postgres;
mod schema;
mod writer;


pub use memory::MemoryStatsStore;
pub use postgres::{build_pool, PgStatsStore};
pub use schema::{KeySchema, SchemaRegistry, SchemaRegistryBuilder};
pub use writer::{StatsStore, StatsWriter, StoreRow};
