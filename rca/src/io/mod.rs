//! I/O boundaries: reasoning engine, sandbox, bridge, config and artifacts.

pub mod artifacts;
pub mod bridge;
pub mod config;
pub mod domain;
pub mod engine;
pub mod prompt;
pub mod sandbox;
