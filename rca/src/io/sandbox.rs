//! Stateful code-execution sandbox.
//!
//! A [`Sandbox`] keeps interpreter state across cells for the length of one
//! diagnostic session. [`PythonSandbox`] runs a persistent Python process
//! that speaks one JSON object per line on stdin/stdout.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::config::SandboxConfig;

const DRIVER_SCRIPT: &str = include_str!("sandbox_driver.py");
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Captured result of one executed cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellOutput {
    /// Combined stdout/stderr, plus the repr of a trailing expression.
    pub output: String,
    /// Traceback or failure description when the cell raised.
    pub error: Option<String>,
}

impl CellOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Isolated, resettable execution resource owned by one loop run.
pub trait Sandbox {
    /// Prepare the session and run `setup_code`. Errors are environment defects.
    fn initialize(&mut self, setup_code: &str) -> Result<()>;

    /// Execute one cell. Cell failures are reported in [`CellOutput::error`];
    /// `Err` is reserved for a sandbox that cannot run code at all.
    fn run(&mut self, code: &str) -> Result<CellOutput>;

    /// Discard all session state. Calling it again is a no-op.
    fn reset(&mut self);
}

#[derive(Serialize)]
struct CellRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct CellResponse {
    output: String,
    error: Option<String>,
}

struct DriverProcess {
    child: Child,
    stdin: ChildStdin,
    responses: Receiver<String>,
}

/// Persistent Python interpreter driven over a line-delimited JSON protocol.
pub struct PythonSandbox {
    python: String,
    cell_timeout: Duration,
    output_limit_bytes: usize,
    setup_code: Option<String>,
    process: Option<DriverProcess>,
}

impl PythonSandbox {
    pub fn new(cfg: &SandboxConfig) -> Self {
        Self {
            python: cfg.python.clone(),
            cell_timeout: Duration::from_secs(cfg.cell_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            setup_code: None,
            process: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    #[instrument(skip_all, fields(python = %self.python))]
    fn spawn(&self) -> Result<DriverProcess> {
        let mut child = Command::new(&self.python)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn sandbox interpreter `{}`", self.python))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        info!(pid = child.id(), "sandbox interpreter started");
        Ok(DriverProcess {
            child,
            stdin,
            responses: rx,
        })
    }

    /// Start the interpreter if needed and replay the setup code.
    fn ensure_started(&mut self) -> Result<()> {
        if self.process.is_some() {
            return Ok(());
        }
        self.process = Some(self.spawn()?);
        if let Some(setup) = self.setup_code.clone() {
            let output = self.exec_cell(&setup)?;
            if let Some(err) = output.error {
                self.reset();
                bail!("sandbox setup code failed:\n{err}");
            }
        }
        Ok(())
    }

    fn exec_cell(&mut self, code: &str) -> Result<CellOutput> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| anyhow!("sandbox is not running"))?;

        let mut request = serde_json::to_string(&CellRequest { code }).context("encode cell")?;
        request.push('\n');
        let sent = process
            .stdin
            .write_all(request.as_bytes())
            .and_then(|()| process.stdin.flush());
        if let Err(err) = sent {
            warn!(err = %err, "sandbox interpreter stopped accepting input");
            self.kill();
            return Ok(CellOutput::failed(
                "",
                format!("sandbox interpreter exited unexpectedly: {err}"),
            ));
        }

        let deadline = Instant::now() + self.cell_timeout;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let line = match process.responses.recv_timeout(wait) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout_secs = self.cell_timeout.as_secs(),
                        "cell timed out, killing interpreter"
                    );
                    self.kill();
                    return Ok(CellOutput::failed(
                        "",
                        format!(
                            "Cell execution timed out after {} seconds. Session state was lost; reload any data you need.",
                            self.cell_timeout.as_secs()
                        ),
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("sandbox interpreter exited during cell");
                    self.kill();
                    return Ok(CellOutput::failed(
                        "",
                        "sandbox interpreter exited unexpectedly. Session state was lost.",
                    ));
                }
            };
            // Anything that is not a response line was written around the
            // protocol stream; it belongs to no cell.
            match serde_json::from_str::<CellResponse>(&line) {
                Ok(response) => {
                    return Ok(CellOutput {
                        output: self.bound_output(response.output),
                        error: response.error,
                    });
                }
                Err(err) => debug!(err = %err, line = %line, "skipping stray sandbox output"),
            }
        }
    }

    fn bound_output(&self, mut output: String) -> String {
        if output.len() <= self.output_limit_bytes {
            return output;
        }
        let dropped = output.len() - self.output_limit_bytes;
        let mut end = self.output_limit_bytes;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        output.truncate(end);
        output.push_str(&format!("\n[output truncated {dropped} bytes]\n"));
        output
    }

    fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.child.kill() {
                debug!(err = %err, "kill sandbox interpreter");
            }
            let _ = process.child.wait();
        }
    }

    /// Close stdin and give the interpreter a moment to exit before killing it.
    fn shutdown(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        let DriverProcess {
            mut child, stdin, ..
        } = process;
        drop(stdin);
        match child.wait_timeout(SHUTDOWN_GRACE) {
            Ok(Some(status)) => debug!(exit_code = ?status.code(), "sandbox interpreter exited"),
            Ok(None) | Err(_) => {
                warn!("sandbox interpreter did not exit, killing");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

impl Sandbox for PythonSandbox {
    fn initialize(&mut self, setup_code: &str) -> Result<()> {
        self.setup_code = (!setup_code.trim().is_empty()).then(|| setup_code.to_string());
        self.ensure_started()
    }

    #[instrument(skip_all, fields(code_bytes = code.len()))]
    fn run(&mut self, code: &str) -> Result<CellOutput> {
        if self.process.is_none() {
            warn!("sandbox interpreter not running, restarting");
        }
        self.ensure_started()?;
        self.exec_cell(code)
    }

    fn reset(&mut self) {
        if self.process.is_some() {
            debug!("resetting sandbox");
        }
        self.shutdown();
        self.setup_code = None;
    }
}

impl Drop for PythonSandbox {
    fn drop(&mut self) {
        self.kill();
    }
}
