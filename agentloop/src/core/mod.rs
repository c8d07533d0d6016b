//! Deterministic, pure logic shared by the execution core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod artifacts;
pub mod breaker;
pub mod budget;
pub mod followups;
pub mod key;
pub mod metrics;
pub mod selector;
pub mod status;
pub mod summary;
pub mod types;
