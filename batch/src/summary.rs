//! `batch.json` summary of one batch invocation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::outcome::Outcome;

pub const SUMMARY_FILE: &str = "batch.json";

/// Result of one problem that was run in this batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProblemRecord {
    pub id: String,
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub context_overflow: usize,
    pub timeout: usize,
    pub error: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    /// Problems with a finished prediction from an earlier batch.
    pub skipped: Vec<String>,
    pub counts: OutcomeCounts,
    pub problems: Vec<ProblemRecord>,
}

impl BatchSummary {
    pub fn new(
        started_at: DateTime<Utc>,
        total: usize,
        skipped: Vec<String>,
        problems: Vec<ProblemRecord>,
    ) -> Self {
        let mut counts = OutcomeCounts::default();
        for problem in &problems {
            match problem.outcome {
                Outcome::Completed => counts.completed += 1,
                Outcome::ContextOverflow => counts.context_overflow += 1,
                Outcome::Timeout => counts.timeout += 1,
                Outcome::Error => counts.error += 1,
            }
        }
        Self {
            started_at,
            finished_at: Utc::now(),
            total,
            skipped,
            counts,
            problems,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

pub fn write_summary(out_dir: &Path, summary: &BatchSummary) -> Result<PathBuf> {
    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let path = out_dir.join(SUMMARY_FILE);
    let contents = serde_json::to_string_pretty(summary).context("serialize summary")?;
    fs::write(&path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, outcome: Outcome) -> ProblemRecord {
        ProblemRecord {
            id: id.to_string(),
            outcome,
            exit_code: Some(0),
            duration_secs: 2.5,
        }
    }

    #[test]
    fn counts_outcomes() {
        let summary = BatchSummary::new(
            Utc::now(),
            5,
            vec!["q0".to_string()],
            vec![
                record("q1", Outcome::Completed),
                record("q2", Outcome::Completed),
                record("q3", Outcome::Timeout),
                record("q4", Outcome::ContextOverflow),
            ],
        );
        assert_eq!(
            summary.counts,
            OutcomeCounts {
                completed: 2,
                context_overflow: 1,
                timeout: 1,
                error: 0,
            }
        );
        assert!(summary.duration_secs() >= 0.0);
    }

    #[test]
    fn writes_snake_case_json() {
        let temp = tempfile::tempdir().expect("tempdir");
        let summary = BatchSummary::new(
            Utc::now(),
            1,
            Vec::new(),
            vec![record("q1", Outcome::ContextOverflow)],
        );
        let path = write_summary(temp.path(), &summary).expect("write");

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json");
        assert_eq!(value["problems"][0]["outcome"], "context_overflow");
        assert_eq!(value["counts"]["context_overflow"], 1);
        assert!(value["started_at"].is_string());
    }
}
