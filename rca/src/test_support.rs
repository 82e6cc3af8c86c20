//! Scripted doubles for the reasoning engine, bridge and sandbox.
//!
//! Enabled for unit tests and, through the `test-support` feature, for
//! integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::{Result, bail};

use crate::core::types::Message;
use crate::io::bridge::{ExecutionBridge, ExecutionHistory, ExecutionOutcome};
use crate::io::domain::DomainContext;
use crate::io::engine::{EngineError, ReasoningEngine};
use crate::io::sandbox::{CellOutput, Sandbox};

pub const SAMPLE_RULES: &str = "Analyze metrics before traces and logs. Use the failure time window only.";
pub const SAMPLE_SCHEMA: &str = "metric_container.csv: timestamp,cmdb_id,kpi_name,value\n\
log_service.csv: log_id,timestamp,cmdb_id,log_name,value";
pub const SAMPLE_CANDIDATES: &str = "## POSSIBLE ROOT CAUSE COMPONENTS:\n\
- frontend\n\
- cartservice\n\
- checkoutservice\n\
\n\
## POSSIBLE ROOT CAUSE REASONS:\n\
- container CPU load\n\
- network latency\n";

/// Domain context with a small microservice taxonomy.
pub fn sample_domain() -> DomainContext {
    DomainContext::new(SAMPLE_RULES, SAMPLE_SCHEMA, SAMPLE_CANDIDATES)
}

/// A well-formed step reply.
pub fn step_reply(analysis: &str, completed: &str, instruction: &str) -> String {
    serde_json::json!({
        "analysis": analysis,
        "completed": completed,
        "instruction": instruction,
    })
    .to_string()
}

/// A contract-conforming final answer naming `component`.
pub fn final_answer_json(component: &str) -> String {
    serde_json::json!({
        "component": component,
        "reason": "container CPU load",
        "reasoning_trace": [
            {"step": 1, "action": format!("QueryMetric({component})"), "observation": "cpu_usage 97% at 10:02"}
        ],
    })
    .to_string()
}

/// Engine that replays queued replies and records every request.
#[derive(Default)]
pub struct ScriptedEngine {
    replies: RefCell<VecDeque<Result<String, EngineError>>>,
    calls: RefCell<Vec<Vec<Message>>>,
}

impl ScriptedEngine {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_replies(replies.into_iter().map(|reply| Ok(reply.into())))
    }

    pub fn from_replies<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, EngineError>>,
    {
        Self {
            replies: RefCell::new(replies.into_iter().collect()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Every message list sent so far, in call order.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.borrow().clone()
    }
}

impl ReasoningEngine for ScriptedEngine {
    fn complete(&self, messages: &[Message], _temperature: f32) -> Result<String, EngineError> {
        self.calls.borrow_mut().push(messages.to_vec());
        self.replies
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError::Transient("no scripted reply left".to_string())))
    }
}

/// Bridge that returns queued `(code, result, success)` outcomes.
#[derive(Default)]
pub struct ScriptedBridge {
    outcomes: RefCell<VecDeque<Result<(String, String, bool), EngineError>>>,
    instructions: RefCell<Vec<String>>,
    run_code: bool,
}

impl ScriptedBridge {
    pub fn new<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Result<(&'static str, &'static str, bool), EngineError>>,
    {
        Self {
            outcomes: RefCell::new(
                outcomes
                    .into_iter()
                    .map(|outcome| {
                        outcome.map(|(code, result, success)| {
                            (code.to_string(), result.to_string(), success)
                        })
                    })
                    .collect(),
            ),
            instructions: RefCell::new(Vec::new()),
            run_code: false,
        }
    }

    /// Also send each scripted code cell to the sandbox.
    pub fn running_code(mut self) -> Self {
        self.run_code = true;
        self
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions.borrow().clone()
    }
}

impl ExecutionBridge for ScriptedBridge {
    fn execute(
        &self,
        instruction: &str,
        _domain: &DomainContext,
        history: &ExecutionHistory,
        sandbox: &mut dyn Sandbox,
    ) -> Result<ExecutionOutcome, EngineError> {
        self.instructions.borrow_mut().push(instruction.to_string());
        let (code, result, success) = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(("pass".to_string(), "(no output)".to_string(), true)))?;
        if self.run_code {
            sandbox
                .run(&code)
                .map_err(|err| EngineError::Transient(err.to_string()))?;
        }
        Ok(ExecutionOutcome {
            code,
            result,
            success,
            history: history.clone(),
        })
    }
}

/// Sandbox that records lifecycle calls and replays queued cell outputs.
#[derive(Debug, Default)]
pub struct RecordingSandbox {
    outputs: VecDeque<CellOutput>,
    cells: Vec<String>,
    setup_code: Option<String>,
    initialize_count: usize,
    reset_count: usize,
    fail_initialize: bool,
}

impl RecordingSandbox {
    pub fn new<I: IntoIterator<Item = CellOutput>>(outputs: I) -> Self {
        Self {
            outputs: outputs.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn failing_initialize() -> Self {
        Self {
            fail_initialize: true,
            ..Self::default()
        }
    }

    pub fn cells(&self) -> Vec<String> {
        self.cells.clone()
    }

    pub fn setup_code(&self) -> Option<&str> {
        self.setup_code.as_deref()
    }

    pub fn initialize_count(&self) -> usize {
        self.initialize_count
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count
    }
}

impl Sandbox for RecordingSandbox {
    fn initialize(&mut self, setup_code: &str) -> Result<()> {
        self.initialize_count += 1;
        if self.fail_initialize {
            bail!("interpreter not found");
        }
        self.setup_code = Some(setup_code.to_string());
        Ok(())
    }

    fn run(&mut self, code: &str) -> Result<CellOutput> {
        self.cells.push(code.to_string());
        Ok(self.outputs.pop_front().unwrap_or_default())
    }

    fn reset(&mut self) {
        self.reset_count += 1;
    }
}
