//! Mock storage implementation for testing.

mod usage_store;

pub use usage_store::MockUsageStore;

#[cfg(test)]
mod tests;
