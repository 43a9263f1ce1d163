//! PostgreSQL implementation of the usage store.

mod copy;
mod usage_store;

pub use usage_store::PostgresUsageStore;
