//! Per-problem artifacts written under the output directory.
//!
//! Layout (one file per problem id):
//!
//! - `trajectory/{id}.json`: executed `{step, code, result}` list
//! - `prompt/{id}.json`: `{"messages": [...]}` transcript
//! - `prediction/{id}.txt`: raw answer text
//! - `meta/{id}.json`: run summary

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::control::LoopOutcome;
use crate::core::types::Termination;

pub const TRAJECTORY_DIR: &str = "trajectory";
pub const PROMPT_DIR: &str = "prompt";
pub const PREDICTION_DIR: &str = "prediction";
pub const META_DIR: &str = "meta";

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub id: String,
    pub objective: String,
    pub termination: Termination,
    pub steps_used: u32,
    pub max_step: u32,
    pub executed_steps: usize,
    pub answer_valid: bool,
    pub answer_errors: Vec<String>,
    pub answer_warnings: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub trajectory_path: PathBuf,
    pub prompt_path: PathBuf,
    pub prediction_path: PathBuf,
    pub meta_path: PathBuf,
}

impl ArtifactPaths {
    pub fn new(out_dir: &Path, id: &str) -> Self {
        Self {
            trajectory_path: out_dir.join(TRAJECTORY_DIR).join(format!("{id}.json")),
            prompt_path: out_dir.join(PROMPT_DIR).join(format!("{id}.json")),
            prediction_path: out_dir.join(PREDICTION_DIR).join(format!("{id}.txt")),
            meta_path: out_dir.join(META_DIR).join(format!("{id}.json")),
        }
    }
}

/// Write all artifacts of one run. The prediction is written last so its
/// presence marks a finished problem.
#[instrument(skip_all, fields(id = %meta.id))]
pub fn write_artifacts(out_dir: &Path, outcome: &LoopOutcome, meta: &RunMeta) -> Result<ArtifactPaths> {
    let paths = ArtifactPaths::new(out_dir, &meta.id);
    write_json(&paths.trajectory_path, &outcome.trajectory)?;
    write_json(&paths.prompt_path, &outcome.transcript)?;
    write_json(&paths.meta_path, meta)?;
    write_text(&paths.prediction_path, &outcome.answer)?;
    debug!(prediction = %paths.prediction_path.display(), "wrote artifacts");
    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}
