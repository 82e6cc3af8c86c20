//! Audit log of executed `(code, result)` pairs.

use serde::{Deserialize, Serialize};

use crate::core::types::TrajectoryEntry;

/// Ordered, append-only record of executed instructions.
///
/// Serializes as a bare JSON array so the persisted file is a list of
/// `{step, code, result}` objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory {
    entries: Vec<TrajectoryEntry>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: u32, code: impl Into<String>, result: impl Into<String>) {
        self.entries.push(TrajectoryEntry {
            step,
            code: code.into(),
            result: result.into(),
        });
    }

    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
