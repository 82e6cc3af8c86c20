//! One `rca run` child process per problem.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Arguments shared by every child run of a batch.
#[derive(Debug, Clone)]
pub struct RcaInvocation {
    pub rca_bin: PathBuf,
    pub domain_dir: PathBuf,
    pub config_path: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildStatus {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_secs: f64,
}

impl RcaInvocation {
    pub fn args(&self, id: &str, objective: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--id".to_string(),
            id.to_string(),
            "--objective".to_string(),
            objective.to_string(),
            "--domain".to_string(),
            self.domain_dir.display().to_string(),
            "--out".to_string(),
            self.out_dir.display().to_string(),
        ];
        if let Some(config) = &self.config_path {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args
    }

    /// Run one problem, capturing stdout and stderr into `log_path`.
    ///
    /// The child is killed when it outlives the timeout.
    pub fn run(&self, id: &str, objective: &str, log_path: &Path) -> Result<ChildStatus> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create logs dir {}", parent.display()))?;
        }
        let log = File::create(log_path)
            .with_context(|| format!("create log {}", log_path.display()))?;
        let log_err = log.try_clone().context("clone log handle")?;

        let started = Instant::now();
        let mut child = Command::new(&self.rca_bin)
            .args(self.args(id, objective))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .with_context(|| format!("spawn {}", self.rca_bin.display()))?;
        debug!(id, pid = child.id(), "child started");

        let mut timed_out = false;
        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                timed_out = true;
                warn!(id, timeout_secs = self.timeout.as_secs(), "run timed out, killing");
                child.kill().ok();
                child.wait().context("wait after kill")?
            }
        };

        Ok(ChildStatus {
            exit_code: status.code(),
            timed_out,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }
}
