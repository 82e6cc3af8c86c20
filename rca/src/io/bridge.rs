//! Instruction-to-code execution bridge.
//!
//! The control loop speaks natural language; the sandbox runs code. An
//! [`ExecutionBridge`] sits between them. [`CodeExecutionBridge`] asks a
//! reasoning engine to write Python for each instruction and self-corrects
//! from tracebacks up to a bounded number of attempts.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Message;
use crate::io::domain::DomainContext;
use crate::io::engine::{EngineError, ReasoningEngine};
use crate::io::prompt::PromptSet;
use crate::io::sandbox::Sandbox;

/// Marker written when self-correction gives up; batch resume looks for it.
pub const MAX_TRY_MARKER: &str = "Max try reached. Please check the history.";
/// Observation reported when a cell succeeds without printing anything.
pub const NO_OUTPUT: &str = "(no output)";
/// Outputs kept in the executor history are clipped to this many bytes.
const HISTORY_OUTPUT_LIMIT: usize = 2_000;

static CODE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:python|py|Python)?[ \t]*\n(.*?)```").expect("code block regex is valid")
});

/// One successfully executed instruction remembered by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub instruction: String,
    pub code: String,
    pub output: String,
}

/// Executor-side memory carried between loop iterations.
///
/// Opaque to the control loop: it is only forwarded from one outcome to the
/// next `execute` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionHistory {
    records: Vec<ExecutionRecord>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn with_record(&self, record: ExecutionRecord) -> Self {
        let mut records = self.records.clone();
        records.push(record);
        Self { records }
    }

    /// Alternating user/assistant turns replaying earlier cells.
    fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.records.len() * 2);
        for record in &self.records {
            messages.push(Message::user(record.instruction.clone()));
            messages.push(Message::assistant(format!(
                "```python\n{}\n```\n\nOutput:\n```\n{}\n```",
                record.code.trim_end(),
                clip(&record.output, HISTORY_OUTPUT_LIMIT)
            )));
        }
        messages
    }
}

/// Result of executing one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Code of the last attempt.
    pub code: String,
    /// Observation forwarded verbatim to the reasoning engine.
    pub result: String,
    pub success: bool,
    pub history: ExecutionHistory,
}

pub trait ExecutionBridge {
    fn execute(
        &self,
        instruction: &str,
        domain: &DomainContext,
        history: &ExecutionHistory,
        sandbox: &mut dyn Sandbox,
    ) -> Result<ExecutionOutcome, EngineError>;
}

impl<T: ExecutionBridge + ?Sized> ExecutionBridge for &T {
    fn execute(
        &self,
        instruction: &str,
        domain: &DomainContext,
        history: &ExecutionHistory,
        sandbox: &mut dyn Sandbox,
    ) -> Result<ExecutionOutcome, EngineError> {
        (**self).execute(instruction, domain, history, sandbox)
    }
}

/// Bridge that has a reasoning engine write Python for each instruction.
pub struct CodeExecutionBridge<E> {
    engine: E,
    prompts: PromptSet,
    max_attempts: u32,
    temperature: f32,
}

impl<E: ReasoningEngine> CodeExecutionBridge<E> {
    pub fn new(engine: E, max_attempts: u32, temperature: f32) -> Self {
        Self {
            engine,
            prompts: PromptSet::new(),
            max_attempts: max_attempts.max(1),
            temperature,
        }
    }
}

impl<E: ReasoningEngine> ExecutionBridge for CodeExecutionBridge<E> {
    #[instrument(skip_all, fields(history = history.len(), max_attempts = self.max_attempts))]
    fn execute(
        &self,
        instruction: &str,
        domain: &DomainContext,
        history: &ExecutionHistory,
        sandbox: &mut dyn Sandbox,
    ) -> Result<ExecutionOutcome, EngineError> {
        let system = self
            .prompts
            .executor_system(domain)
            .map_err(|err| EngineError::Transient(format!("{err:#}")))?;
        let mut conversation = vec![Message::system(system)];
        conversation.extend(history.to_messages());
        conversation.push(Message::user(instruction));

        let mut last_code = String::new();
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            let reply = self.engine.complete(&conversation, self.temperature)?;
            let code = extract_code(&reply).to_string();
            debug!(attempt, code = %code, "executor wrote code");
            conversation.push(Message::assistant(reply));

            let cell = sandbox
                .run(&code)
                .map_err(|err| EngineError::Transient(format!("sandbox failure: {err:#}")))?;
            match cell.error {
                None => {
                    let result = if cell.output.trim().is_empty() {
                        NO_OUTPUT.to_string()
                    } else {
                        cell.output
                    };
                    info!(attempt, "instruction executed");
                    let history = history.with_record(ExecutionRecord {
                        instruction: instruction.to_string(),
                        code: code.clone(),
                        output: result.clone(),
                    });
                    return Ok(ExecutionOutcome {
                        code,
                        result,
                        success: true,
                        history,
                    });
                }
                Some(error) => {
                    warn!(attempt, "cell failed");
                    last_error = if cell.output.trim().is_empty() {
                        error
                    } else {
                        format!("{}\n{error}", cell.output.trim_end())
                    };
                    last_code = code;
                    if attempt < self.max_attempts {
                        let retry = self
                            .prompts
                            .executor_retry(&last_error)
                            .map_err(|err| EngineError::Transient(format!("{err:#}")))?;
                        conversation.push(Message::user(retry));
                    }
                }
            }
        }

        warn!("{MAX_TRY_MARKER}");
        Ok(ExecutionOutcome {
            code: last_code,
            result: format!(
                "The Executor failed to complete the instruction after {} attempts. Last error:\n{}\n{MAX_TRY_MARKER}",
                self.max_attempts,
                last_error.trim_end()
            ),
            success: false,
            history: history.clone(),
        })
    }
}

/// First fenced code block of a reply, or the whole reply when unfenced.
pub fn extract_code(reply: &str) -> &str {
    match CODE_BLOCK_RE.captures(reply).and_then(|caps| caps.get(1)) {
        Some(code) => code.as_str().trim(),
        None => reply.trim(),
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated]", &text[..end])
}
