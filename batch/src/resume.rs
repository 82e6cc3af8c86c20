//! Decide which problems of a batch still need to run.
//!
//! A problem is done when its prediction exists and its history log shows no
//! exhausted self-correction. Anything else is cleared and rerun.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rca::io::artifacts::ArtifactPaths;
use tracing::{debug, info};

pub const HISTORY_DIR: &str = "history";

/// Substring of the executor's give-up marker that triggers a rerun.
const RERUN_MARKER: &str = "Max try reached. Please check the history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDecision {
    Skip,
    Run,
}

pub fn prediction_path(out_dir: &Path, id: &str) -> PathBuf {
    ArtifactPaths::new(out_dir, id).prediction_path
}

pub fn history_path(out_dir: &Path, id: &str) -> PathBuf {
    out_dir.join(HISTORY_DIR).join(format!("{id}.log"))
}

/// Decide whether `id` runs, removing stale files when it does.
pub fn plan_problem(out_dir: &Path, id: &str) -> Result<ResumeDecision> {
    let prediction = prediction_path(out_dir, id);
    if !prediction.exists() {
        return Ok(ResumeDecision::Run);
    }
    let history = history_path(out_dir, id);
    match fs::read(&history) {
        Ok(bytes) => {
            if !String::from_utf8_lossy(&bytes).contains(RERUN_MARKER) {
                debug!(id, "prediction exists, skipping");
                return Ok(ResumeDecision::Skip);
            }
            info!(id, "max try reached in history, rerunning");
            remove_file(&history)?;
            remove_file(&prediction)?;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(id, "prediction without history, rerunning");
            remove_file(&prediction)?;
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", history.display()));
        }
    }
    Ok(ResumeDecision::Run)
}

fn remove_file(path: &Path) -> Result<()> {
    fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
}
