//! Orchestration for `rca run` and `rca check-answer`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument};

use crate::control::{ControlLoop, DiagnosisRequest, LoopOutcome};
use crate::core::answer::{AnswerError, FinalAnswer};
use crate::core::types::Termination;
use crate::exit_codes;
use crate::io::artifacts::{ArtifactPaths, RunMeta, write_artifacts};
use crate::io::bridge::{CodeExecutionBridge, ExecutionBridge};
use crate::io::config::{RcaConfig, load_config, write_config};
use crate::io::domain::DomainContext;
use crate::io::engine::{OpenAiEngine, ReasoningEngine};
use crate::io::sandbox::{PythonSandbox, Sandbox};

/// Inputs of `rca run` after CLI parsing.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub id: String,
    pub objective: String,
    pub domain_dir: PathBuf,
    pub config_path: PathBuf,
    pub out_dir: PathBuf,
    pub max_step: Option<u32>,
    pub temperature: Option<f32>,
}

/// Result of one persisted diagnosis.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: LoopOutcome,
    pub paths: ArtifactPaths,
    pub answer_valid: bool,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        match self.outcome.termination {
            Termination::ContextOverflow => exit_codes::CONTEXT_OVERFLOW,
            Termination::FinalizeFailed => exit_codes::FINALIZE_FAILED,
            Termination::Completed | Termination::StepsExhausted => exit_codes::OK,
        }
    }
}

/// Problem ids become file names, so keep them to a safe character set.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Run one diagnosis with the configured HTTP engine and Python sandbox.
pub fn run_from_options(opts: &RunOptions) -> Result<RunReport> {
    validate_id(&opts.id)?;
    if opts.objective.trim().is_empty() {
        return Err(anyhow!("objective must not be empty"));
    }

    let mut cfg = load_config(&opts.config_path).context("load config")?;
    if let Some(max_step) = opts.max_step {
        cfg.max_step = max_step;
    }
    if let Some(temperature) = opts.temperature {
        cfg.temperature = temperature;
    }
    cfg.validate()?;

    let domain = DomainContext::load(&opts.domain_dir).context("load domain context")?;
    let engine = OpenAiEngine::from_config(&cfg.engine)?;
    let bridge = CodeExecutionBridge::new(engine.clone(), cfg.executor.max_attempts, cfg.temperature);
    let control = ControlLoop::new(engine, bridge, domain, cfg.sandbox.setup_code.clone());
    let mut sandbox = PythonSandbox::new(&cfg.sandbox);

    let request = DiagnosisRequest {
        objective: opts.objective.clone(),
        max_step: cfg.max_step,
        temperature: cfg.temperature,
    };
    run_diagnosis(&control, &mut sandbox, &opts.id, &request, &opts.out_dir)
}

/// Run the loop for one problem and persist its artifacts.
#[instrument(skip_all, fields(id = %id))]
pub fn run_diagnosis<E: ReasoningEngine, B: ExecutionBridge>(
    control: &ControlLoop<E, B>,
    sandbox: &mut dyn Sandbox,
    id: &str,
    request: &DiagnosisRequest,
    out_dir: &Path,
) -> Result<RunReport> {
    validate_id(id)?;
    info!(objective = %request.objective, "starting diagnosis");
    let started = Instant::now();
    let outcome = control.run(sandbox, request)?;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (answer_valid, answer_errors, answer_warnings) = match outcome.check_answer(control.domain()) {
        Ok(answer) => (true, Vec::new(), answer.warnings()),
        Err(err) => (false, vec![err.to_string()], Vec::new()),
    };
    let meta = RunMeta {
        id: id.to_string(),
        objective: request.objective.clone(),
        termination: outcome.termination,
        steps_used: outcome.steps_used,
        max_step: request.max_step,
        executed_steps: outcome.trajectory.len(),
        answer_valid,
        answer_errors,
        answer_warnings,
        duration_ms,
    };
    let paths = write_artifacts(out_dir, &outcome, &meta)?;
    info!(
        termination = outcome.termination.as_str(),
        steps_used = outcome.steps_used,
        answer_valid,
        "diagnosis saved"
    );
    Ok(RunReport {
        outcome,
        paths,
        answer_valid,
    })
}

/// Write a default config file for editing.
pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    write_config(path, &RcaConfig::default())?;
    info!(path = %path.display(), "wrote default config");
    Ok(())
}

/// Validate a saved prediction against the answer contract of `domain_dir`.
pub fn check_answer_file(domain_dir: &Path, file: &Path) -> Result<Result<FinalAnswer, AnswerError>> {
    let domain = DomainContext::load(domain_dir).context("load domain context")?;
    let text =
        fs::read_to_string(file).with_context(|| format!("read prediction {}", file.display()))?;
    Ok(FinalAnswer::parse(&text, domain.taxonomy()))
}
