//! Batch orchestration.
//!
//! Loads the queries, resumes from earlier output, runs the remaining
//! problems on a bounded pool of worker threads and writes the summary.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{error, info, instrument};

use crate::child::{ChildStatus, RcaInvocation};
use crate::outcome::{Outcome, classify_outcome};
use crate::queries::{Query, load_queries};
use crate::resume::{ResumeDecision, history_path, plan_problem};
use crate::summary::{BatchSummary, ProblemRecord, write_summary};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub queries_path: PathBuf,
    pub out_dir: PathBuf,
    pub domain_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub procs: usize,
    pub timeout: Duration,
    pub rca_bin: PathBuf,
}

/// Run every unfinished query of `opts.queries_path`.
#[instrument(skip_all, fields(queries = %opts.queries_path.display()))]
pub fn run_batch(opts: &BatchOptions) -> Result<BatchSummary> {
    if opts.procs == 0 {
        bail!("procs must be >= 1");
    }
    let queries = load_queries(&opts.queries_path)?;
    let started_at = Utc::now();

    let mut pending = Vec::new();
    let mut skipped = Vec::new();
    for query in &queries {
        match plan_problem(&opts.out_dir, &query.id)? {
            ResumeDecision::Skip => skipped.push(query.id.clone()),
            ResumeDecision::Run => pending.push(query.clone()),
        }
    }

    let workers = worker_count(opts.procs);
    info!(
        total = queries.len(),
        pending = pending.len(),
        skipped = skipped.len(),
        workers,
        "batch started"
    );

    let invocation = RcaInvocation {
        rca_bin: opts.rca_bin.clone(),
        domain_dir: opts.domain_dir.clone(),
        config_path: opts.config_path.clone(),
        out_dir: opts.out_dir.clone(),
        timeout: opts.timeout,
    };
    let problems = run_pool(pending, workers, |query| {
        invocation.run(
            &query.id,
            &query.instruction,
            &history_path(&opts.out_dir, &query.id),
        )
    });

    let summary = BatchSummary::new(started_at, queries.len(), skipped, problems);
    let path = write_summary(&opts.out_dir, &summary).context("write batch summary")?;
    info!(
        completed = summary.counts.completed,
        context_overflow = summary.counts.context_overflow,
        timeout = summary.counts.timeout,
        error = summary.counts.error,
        summary = %path.display(),
        "batch finished"
    );
    Ok(summary)
}

/// `procs` capped by the machine's parallelism.
pub fn worker_count(procs: usize) -> usize {
    let available = thread::available_parallelism().map_or(1, |n| n.get());
    procs.min(available).max(1)
}

/// Run `queries` on `workers` threads. Records come back in query order.
pub fn run_pool<F>(queries: Vec<Query>, workers: usize, run_one: F) -> Vec<ProblemRecord>
where
    F: Fn(&Query) -> Result<ChildStatus> + Sync,
{
    let total = queries.len();
    let queue = Mutex::new(queries.into_iter().enumerate().collect::<VecDeque<_>>());
    let records = Mutex::new(Vec::with_capacity(total));

    thread::scope(|scope| {
        for _ in 0..workers.min(total) {
            scope.spawn(|| {
                loop {
                    let next = queue.lock().ok().and_then(|mut queue| queue.pop_front());
                    let Some((index, query)) = next else {
                        break;
                    };
                    let record = run_problem(&query, &run_one);
                    if let Ok(mut records) = records.lock() {
                        records.push((index, record));
                    }
                }
            });
        }
    });

    let mut records = records.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
    records.sort_by_key(|(index, _)| *index);
    records.into_iter().map(|(_, record)| record).collect()
}

fn run_problem<F>(query: &Query, run_one: &F) -> ProblemRecord
where
    F: Fn(&Query) -> Result<ChildStatus>,
{
    match run_one(query) {
        Ok(status) => {
            let outcome = classify_outcome(&status);
            info!(
                id = %query.id,
                outcome = ?outcome,
                exit_code = ?status.exit_code,
                duration_secs = status.duration_secs,
                "problem finished"
            );
            ProblemRecord {
                id: query.id.clone(),
                outcome,
                exit_code: status.exit_code,
                duration_secs: status.duration_secs,
            }
        }
        Err(err) => {
            error!(id = %query.id, "problem failed to run: {err:#}");
            ProblemRecord {
                id: query.id.clone(),
                outcome: Outcome::Error,
                exit_code: None,
                duration_secs: 0.0,
            }
        }
    }
}

/// Default `rca` binary: the sibling of the running `rca-batch` executable.
pub fn default_rca_bin() -> PathBuf {
    let name = format!("rca{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|path| path.exists())
        .unwrap_or_else(|| PathBuf::from(name))
}

pub fn summary_line(summary: &BatchSummary, out_dir: &Path) -> String {
    format!(
        "batch: total={} skipped={} completed={} context_overflow={} timeout={} error={} out={}",
        summary.total,
        summary.skipped.len(),
        summary.counts.completed,
        summary.counts.context_overflow,
        summary.counts.timeout,
        summary.counts.error,
        out_dir.display()
    )
}
