//! Shared storage integration tests.
//!
//! Tests the UsageStore interface against every implementation.
//! Each implementation's test binary runs them through the macro.

pub mod usage_store_tests;
