//! Deterministic, pure logic shared by the control loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod answer;
pub mod budget;
pub mod parser;
pub mod trajectory;
pub mod transcript;
pub mod types;
