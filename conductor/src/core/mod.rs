//! Deterministic, pure logic shared by the orchestration engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod conflict;
pub mod errors;
pub mod graph;
pub mod promise;
pub mod ready;
pub mod transitions;
pub mod types;
