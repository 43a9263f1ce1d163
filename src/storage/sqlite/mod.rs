//! SQLite implementation of the usage store.

mod usage_store;

pub use usage_store::{fetch_facts, SqliteUsageStore};
