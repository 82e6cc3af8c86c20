//! Diagnostic control loop.
//!
//! Drives the dialogue between the reasoning engine and the sandbox:
//!
//! 1. Seed the transcript with the framing system message and the opening turn.
//! 2. Each step, send the transcript plus an ephemeral reminder, parse the reply,
//!    and either execute its instruction or stop on completion.
//! 3. On completion or step exhaustion, reset the sandbox and request the final
//!    answer.
//!
//! Malformed replies and transient failures cost one step and are answered
//! with a corrective turn. A context overflow stops the run with a sentinel
//! answer. The sandbox is reset exactly once on every exit path.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::answer::{AnswerError, FinalAnswer};
use crate::core::budget::LoopBudget;
use crate::core::parser::{parse_step_response, unwrap_fenced};
use crate::core::trajectory::Trajectory;
use crate::core::transcript::Transcript;
use crate::core::types::{
    CONTEXT_OVERFLOW_ANSWER, FINALIZE_FAILED_ANSWER, LoopState, Message, Termination,
};
use crate::io::bridge::{ExecutionBridge, ExecutionHistory};
use crate::io::domain::DomainContext;
use crate::io::engine::{EngineError, ReasoningEngine};
use crate::io::prompt::{OPENING_TURN, PromptSet};
use crate::io::sandbox::Sandbox;

/// Appended after an engine or bridge failure message.
const FORMAT_REQUEST_SUFFIX: &str = "Please provide your analysis in requested JSON format.";
/// Attempts for the finalization call when it fails transiently.
const FINALIZE_ATTEMPTS: u32 = 3;
const PREVIEW_CHARS: usize = 400;

/// One diagnosis to run.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosisRequest {
    pub objective: String,
    pub max_step: u32,
    pub temperature: f32,
}

/// Everything a run produced, handed back to the caller for persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Final answer text with any JSON fence removed, or the overflow sentinel.
    pub answer: String,
    pub trajectory: Trajectory,
    pub transcript: Transcript,
    pub termination: Termination,
    pub steps_used: u32,
}

impl LoopOutcome {
    /// Check the answer against the final-answer contract and the taxonomy.
    pub fn check_answer(&self, domain: &DomainContext) -> Result<FinalAnswer, AnswerError> {
        FinalAnswer::parse(&self.answer, domain.taxonomy())
    }
}

/// Prompts rendered once per run from the objective and the domain.
struct SessionPrompts {
    system: String,
    reminder: String,
    finalize_completed: String,
    finalize_exhausted: String,
}

impl SessionPrompts {
    fn render(prompts: &PromptSet, domain: &DomainContext, objective: &str) -> Result<Self> {
        Ok(Self {
            system: prompts.system(domain, objective)?,
            reminder: prompts.reminder(domain, objective)?,
            finalize_completed: prompts.finalize(domain, objective, false)?,
            finalize_exhausted: prompts.finalize(domain, objective, true)?,
        })
    }
}

/// Mutable state of one run.
struct Session {
    state: LoopState,
    transcript: Transcript,
    trajectory: Trajectory,
    budget: LoopBudget,
    history: ExecutionHistory,
}

impl Session {
    fn transition(&mut self, next: LoopState) {
        debug!(from = ?self.state, to = ?next, "loop state");
        self.state = next;
    }
}

/// How the step loop ended.
enum IterationExit {
    Completed { reply: String },
    Exhausted,
    ContextOverflow,
}

/// Orchestrates one diagnostic session per [`ControlLoop::run`] call.
pub struct ControlLoop<E, B> {
    engine: E,
    bridge: B,
    prompts: PromptSet,
    domain: DomainContext,
    setup_code: String,
}

impl<E: ReasoningEngine, B: ExecutionBridge> ControlLoop<E, B> {
    pub fn new(engine: E, bridge: B, domain: DomainContext, setup_code: impl Into<String>) -> Self {
        Self {
            engine,
            bridge,
            prompts: PromptSet::new(),
            domain,
            setup_code: setup_code.into(),
        }
    }

    pub fn domain(&self) -> &DomainContext {
        &self.domain
    }

    /// Run one diagnosis to completion.
    ///
    /// Returns `Err` only when the run cannot start (prompt rendering or
    /// sandbox start-up). Every run that starts yields an outcome with its
    /// trajectory and transcript.
    #[instrument(skip_all, fields(max_step = request.max_step))]
    pub fn run(&self, sandbox: &mut dyn Sandbox, request: &DiagnosisRequest) -> Result<LoopOutcome> {
        let prompts = SessionPrompts::render(&self.prompts, &self.domain, &request.objective)?;
        let mut session = Session {
            state: LoopState::Running,
            transcript: Transcript::new(),
            trajectory: Trajectory::new(),
            budget: LoopBudget::new(request.max_step),
            history: ExecutionHistory::new(),
        };
        session.transcript.push(Message::system(prompts.system.clone()));
        session.transcript.push_user(OPENING_TURN);

        if let Err(err) = sandbox.initialize(&self.setup_code) {
            sandbox.reset();
            return Err(err.context("initialize sandbox"));
        }

        let exit = self.iterate(sandbox, request, &prompts, &mut session);
        sandbox.reset();

        let (answer, termination) = match exit {
            IterationExit::Completed { reply } => {
                session.transition(LoopState::AwaitingCompletionAnswer);
                session.transcript.push_assistant(reply);
                session.transcript.push_user(prompts.finalize_completed);
                self.finalize(&mut session, request.temperature, Termination::Completed)
            }
            IterationExit::Exhausted => {
                warn!(max_step = request.max_step, "Max steps reached. Please check the history.");
                session.transition(LoopState::ForcedTermination);
                session.transcript.set_final_prompt(prompts.finalize_exhausted);
                self.finalize(&mut session, request.temperature, Termination::StepsExhausted)
            }
            IterationExit::ContextOverflow => {
                session.transition(LoopState::Fatal);
                (CONTEXT_OVERFLOW_ANSWER.to_string(), Termination::ContextOverflow)
            }
        };
        debug_assert!(session.state.is_terminal());

        info!(
            termination = termination.as_str(),
            steps_used = session.budget.current_step(),
            executed = session.trajectory.len(),
            "diagnosis finished"
        );
        Ok(LoopOutcome {
            answer,
            trajectory: session.trajectory,
            transcript: session.transcript,
            termination,
            steps_used: session.budget.current_step(),
        })
    }

    fn iterate(
        &self,
        sandbox: &mut dyn Sandbox,
        request: &DiagnosisRequest,
        prompts: &SessionPrompts,
        session: &mut Session,
    ) -> IterationExit {
        while let Some(step) = session.budget.next_step() {
            let call = session.transcript.with_note(&prompts.reminder);
            let raw = match self.engine.complete(&call, request.temperature) {
                Ok(raw) => raw,
                Err(err @ EngineError::ContextOverflow(_)) => {
                    warn!(step, %err, "Token length exceeds the limit.");
                    session.transcript.push_user(err.to_string());
                    return IterationExit::ContextOverflow;
                }
                Err(EngineError::Transient(message)) => {
                    warn!(step, %message, "engine call failed");
                    session
                        .transcript
                        .push_user(format!("{message}\n{FORMAT_REQUEST_SUFFIX}"));
                    continue;
                }
            };
            debug!(step, raw = %raw, "engine reply");

            let response = match parse_step_response(&raw) {
                Ok(response) => response,
                Err(err) => {
                    warn!(step, error = %err, "malformed reply");
                    session.transcript.push_assistant(raw);
                    session.transcript.push_user(err.corrective_message());
                    continue;
                }
            };
            info!(
                step,
                remaining = session.budget.remaining(),
                analysis = response.analysis.as_deref().unwrap_or("None"),
                instruction = %response.instruction,
                "step reply"
            );

            if response.is_completed() {
                return IterationExit::Completed { reply: raw };
            }

            let outcome = match self.bridge.execute(
                &response.instruction,
                &self.domain,
                &session.history,
                sandbox,
            ) {
                Ok(outcome) => outcome,
                Err(err @ EngineError::ContextOverflow(_)) => {
                    warn!(step, %err, "Token length exceeds the limit.");
                    session.transcript.push_assistant(raw);
                    session.transcript.push_user(err.to_string());
                    return IterationExit::ContextOverflow;
                }
                Err(EngineError::Transient(message)) => {
                    warn!(step, %message, "execution bridge failed");
                    session.transcript.push_assistant(raw);
                    session
                        .transcript
                        .push_user(format!("{message}\n{FORMAT_REQUEST_SUFFIX}"));
                    continue;
                }
            };
            if !outcome.success {
                warn!(step, "Self-correction failed.");
            }
            info!(step, observation = %preview(&outcome.result), "observation");

            session
                .trajectory
                .record(step, outcome.code, outcome.result.clone());
            session.transcript.push_assistant(raw);
            session.transcript.push_user(outcome.result);
            session.history = outcome.history;
        }
        IterationExit::Exhausted
    }

    /// Request the final answer; the finalization prompt is already the last turn.
    fn finalize(
        &self,
        session: &mut Session,
        temperature: f32,
        termination: Termination,
    ) -> (String, Termination) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.engine.complete(session.transcript.messages(), temperature) {
                Ok(reply) => {
                    debug!(raw = %reply, "final answer reply");
                    let answer = unwrap_fenced(&reply).to_string();
                    session.transcript.push_assistant(reply);
                    session.transition(LoopState::Done);
                    self.log_answer_check(&answer);
                    return (answer, termination);
                }
                Err(EngineError::ContextOverflow(message)) => {
                    warn!(%message, "Token length exceeds the limit.");
                    session.transition(LoopState::Fatal);
                    return (
                        CONTEXT_OVERFLOW_ANSWER.to_string(),
                        Termination::ContextOverflow,
                    );
                }
                Err(EngineError::Transient(message)) => {
                    warn!(attempt, %message, "final answer request failed");
                }
            }
        }
        warn!(attempts = FINALIZE_ATTEMPTS, "giving up on the final answer");
        session.transition(LoopState::Fatal);
        (
            FINALIZE_FAILED_ANSWER.to_string(),
            Termination::FinalizeFailed,
        )
    }

    fn log_answer_check(&self, answer: &str) {
        match FinalAnswer::parse(answer, self.domain.taxonomy()) {
            Ok(parsed) => {
                for warning in parsed.warnings() {
                    warn!(%warning, "final answer contract");
                }
                info!(component = %parsed.component, reason = %parsed.reason, "final answer");
            }
            Err(err) => warn!(error = %err, "final answer does not match the contract"),
        }
    }
}

fn preview(text: &str) -> &str {
    if text.len() <= PREVIEW_CHARS {
        return text;
    }
    let mut end = PREVIEW_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Role;
    use crate::io::sandbox::CellOutput;
    use crate::test_support::{
        RecordingSandbox, ScriptedBridge, ScriptedEngine, final_answer_json, sample_domain,
        step_reply,
    };

    fn request(max_step: u32) -> DiagnosisRequest {
        DiagnosisRequest {
            objective: "Find the root cause component of the failure at 10:00.".to_string(),
            max_step,
            temperature: 0.0,
        }
    }

    fn control_loop<'a>(
        engine: &'a ScriptedEngine,
        bridge: &'a ScriptedBridge,
    ) -> ControlLoop<&'a ScriptedEngine, &'a ScriptedBridge> {
        ControlLoop::new(engine, bridge, sample_domain(), "import pandas as pd")
    }

    #[test]
    fn malformed_replies_consume_steps_without_trajectory() {
        let engine = ScriptedEngine::new([
            "I am not sure yet.".to_string(),
            r#"{"analysis": "x", "completed": "False", "instruction": null}"#.to_string(),
            step_reply("done", "True", "frontend CPU saturation"),
            final_answer_json("frontend"),
        ]);
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(10))
            .expect("run");

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.steps_used, 3);
        assert!(outcome.trajectory.is_empty());
        assert!(bridge.instructions().is_empty());

        let messages = outcome.transcript.messages();
        assert_eq!(messages[2], Message::assistant("I am not sure yet."));
        assert_eq!(
            messages[3],
            Message::user("Please provide your analysis in requested JSON format.")
        );
        assert_eq!(
            messages[5],
            Message::user("LLM response missing required fields. Please check your output format.")
        );
    }

    #[test]
    fn reminder_is_sent_but_not_retained() {
        let engine = ScriptedEngine::new([
            step_reply("first", "False", "load metrics"),
            step_reply("second", "True", "frontend"),
            final_answer_json("frontend"),
        ]);
        let bridge = ScriptedBridge::new([Ok(("df = load()", "loaded", true))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(5))
            .expect("run");

        let calls = engine.calls();
        let first = &calls[0];
        assert_eq!(first.len(), 3);
        assert!(
            first[2]
                .content
                .starts_with("Continue your reasoning process for the target issue:")
        );
        assert!(
            outcome
                .transcript
                .messages()
                .iter()
                .all(|message| !message.content.starts_with("Continue your reasoning"))
        );
    }

    #[test]
    fn executed_step_appends_reply_observation_and_trajectory() {
        let first = step_reply("none", "False", "compute mean latency");
        let engine = ScriptedEngine::new([
            first.clone(),
            step_reply("frontend slow", "True", "frontend"),
            final_answer_json("frontend"),
        ]);
        let bridge = ScriptedBridge::new([Ok(("df.mean()", "latency 12ms", true))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(5))
            .expect("run");

        assert_eq!(bridge.instructions(), vec!["compute mean latency".to_string()]);
        let entries = outcome.trajectory.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].step, 1);
        assert_eq!(entries[0].code, "df.mean()");
        assert_eq!(entries[0].result, "latency 12ms");

        let messages = outcome.transcript.messages();
        assert_eq!(messages[2], Message::assistant(first));
        assert_eq!(messages[3], Message::user("latency 12ms"));
    }

    #[test]
    fn failed_execution_result_is_forwarded_verbatim() {
        let engine = ScriptedEngine::new([
            step_reply("none", "False", "read logs"),
            step_reply("none", "True", "frontend"),
            final_answer_json("frontend"),
        ]);
        let failure = "The Executor failed. Max try reached. Please check the history.";
        let bridge = ScriptedBridge::new([Ok(("open('x')", failure, false))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(5))
            .expect("run");

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.trajectory.entries()[0].result, failure);
        assert_eq!(outcome.transcript.messages()[3], Message::user(failure));
    }

    #[test]
    fn completion_resets_once_and_unwraps_fenced_answer() {
        let answer = final_answer_json("frontend");
        let engine = ScriptedEngine::new([
            step_reply("cpu high", "True", "frontend CPU"),
            format!("```json\n{answer}\n```"),
        ]);
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(5))
            .expect("run");

        assert_eq!(outcome.answer, answer);
        assert_eq!(outcome.steps_used, 1);
        assert_eq!(sandbox.initialize_count(), 1);
        assert_eq!(sandbox.reset_count(), 1);

        let messages = outcome.transcript.messages();
        let finalize = &messages[messages.len() - 2];
        assert_eq!(finalize.role, Role::User);
        assert!(finalize.content.starts_with("Now, you have decided to finish"));
        assert_eq!(messages.last().map(|m| m.role), Some(Role::Assistant));
    }

    #[test]
    fn exhaustion_forces_answer_and_overwrites_trailing_user_turn() {
        let engine = ScriptedEngine::new([
            step_reply("none", "False", "load metrics"),
            final_answer_json("cartservice"),
        ]);
        let bridge = ScriptedBridge::new([Ok(("df = load()", "loaded", true))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(1))
            .expect("run");

        assert_eq!(outcome.termination, Termination::StepsExhausted);
        assert!(!outcome.answer.is_empty());
        assert_eq!(outcome.steps_used, 1);
        assert_eq!(sandbox.reset_count(), 1);

        let messages = outcome.transcript.messages();
        // system, opening, reply, finalize (overwrote observation), answer
        assert_eq!(messages.len(), 5);
        assert!(
            messages[3]
                .content
                .starts_with("Now, the maximum steps of your reasoning have been reached.")
        );
        assert!(messages.iter().all(|message| message.content != "loaded"));
    }

    #[test]
    fn zero_budget_overwrites_opening_turn() {
        let engine = ScriptedEngine::new([final_answer_json("frontend")]);
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(0))
            .expect("run");

        let messages = outcome.transcript.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, Role::User);
        assert!(messages[1].content.starts_with("Now, the maximum steps"));
        assert_eq!(outcome.steps_used, 0);
    }

    #[test]
    fn overflow_mid_run_returns_sentinel_without_further_calls() {
        let engine = ScriptedEngine::from_replies([
            Ok(step_reply("a", "False", "step one")),
            Ok(step_reply("b", "False", "step two")),
            Err(EngineError::ContextOverflow("too many tokens".to_string())),
            Ok(step_reply("never", "False", "never")),
        ]);
        let bridge = ScriptedBridge::new([Ok(("a", "1", true)), Ok(("b", "2", true))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(10))
            .expect("run");

        assert_eq!(outcome.answer, CONTEXT_OVERFLOW_ANSWER);
        assert_eq!(outcome.termination, Termination::ContextOverflow);
        assert_eq!(outcome.steps_used, 3);
        assert_eq!(engine.calls().len(), 3);
        assert_eq!(outcome.trajectory.len(), 2);
        assert_eq!(sandbox.reset_count(), 1);
        assert_eq!(
            outcome.transcript.last(),
            Some(&Message::user("context_length_exceeded: too many tokens"))
        );
    }

    #[test]
    fn bridge_overflow_is_fatal() {
        let engine = ScriptedEngine::new([step_reply("a", "False", "huge query")]);
        let bridge = ScriptedBridge::new([Err(EngineError::ContextOverflow("executor".to_string()))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(10))
            .expect("run");

        assert_eq!(outcome.answer, CONTEXT_OVERFLOW_ANSWER);
        assert_eq!(engine.calls().len(), 1);
        assert_eq!(sandbox.reset_count(), 1);

        let messages = outcome.transcript.messages();
        let tail = &messages[messages.len() - 2..];
        assert_eq!(tail[0].role, Role::Assistant);
        assert!(tail[0].content.contains("huge query"));
        assert_eq!(tail[1], Message::user("context_length_exceeded: executor"));
    }

    #[test]
    fn transient_engine_error_consumes_step_with_corrective_turn() {
        let engine = ScriptedEngine::from_replies([
            Err(EngineError::Transient("connection reset".to_string())),
            Ok(step_reply("a", "True", "frontend")),
            Ok(final_answer_json("frontend")),
        ]);
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(10))
            .expect("run");

        assert_eq!(outcome.steps_used, 2);
        assert_eq!(
            outcome.transcript.messages()[2],
            Message::user("connection reset\nPlease provide your analysis in requested JSON format.")
        );
    }

    #[test]
    fn overflow_during_finalization_yields_sentinel_with_single_reset() {
        let engine = ScriptedEngine::from_replies([
            Ok(step_reply("a", "True", "frontend")),
            Err(EngineError::ContextOverflow("too long".to_string())),
        ]);
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(10))
            .expect("run");

        assert_eq!(outcome.answer, CONTEXT_OVERFLOW_ANSWER);
        assert_eq!(outcome.termination, Termination::ContextOverflow);
        assert_eq!(sandbox.reset_count(), 1);
    }

    #[test]
    fn failed_finalization_keeps_trajectory_and_returns_sentinel() {
        let engine = ScriptedEngine::from_replies([
            Ok(step_reply("a", "False", "load metrics")),
            Ok(step_reply("b", "True", "frontend")),
            Err(EngineError::Transient("503".to_string())),
            Err(EngineError::Transient("503".to_string())),
            Err(EngineError::Transient("503".to_string())),
        ]);
        let bridge = ScriptedBridge::new([Ok(("df = load()", "loaded", true))]);
        let mut sandbox = RecordingSandbox::default();

        let outcome = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(10))
            .expect("run");

        assert_eq!(outcome.answer, FINALIZE_FAILED_ANSWER);
        assert_eq!(outcome.termination, Termination::FinalizeFailed);
        assert_eq!(outcome.trajectory.len(), 1);
        assert_eq!(engine.calls().len(), 2 + FINALIZE_ATTEMPTS as usize);
        assert_eq!(sandbox.reset_count(), 1);
        let last = outcome.transcript.last().expect("last turn");
        assert!(last.content.starts_with("Now, you have decided to finish"));
    }

    #[test]
    fn sandbox_start_failure_resets_and_errors() {
        let engine = ScriptedEngine::new(Vec::<String>::new());
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::failing_initialize();

        let err = control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(3))
            .unwrap_err();

        assert!(format!("{err:#}").contains("initialize sandbox"));
        assert_eq!(sandbox.reset_count(), 1);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn sandbox_is_driven_by_the_bridge() {
        let engine = ScriptedEngine::new([
            step_reply("a", "False", "print one"),
            step_reply("b", "True", "frontend"),
            final_answer_json("frontend"),
        ]);
        let bridge = ScriptedBridge::new([Ok(("print(1)", "1", true))]).running_code();
        let mut sandbox = RecordingSandbox::new([CellOutput::ok("1")]);

        control_loop(&engine, &bridge)
            .run(&mut sandbox, &request(5))
            .expect("run");

        assert_eq!(sandbox.cells(), vec!["print(1)".to_string()]);
        assert_eq!(sandbox.setup_code(), Some("import pandas as pd"));
    }

    #[test]
    fn check_answer_reports_unknown_component() {
        let engine = ScriptedEngine::new([
            step_reply("a", "True", "frontend"),
            final_answer_json("front-end"),
        ]);
        let bridge = ScriptedBridge::default();
        let mut sandbox = RecordingSandbox::default();
        let control = control_loop(&engine, &bridge);

        let outcome = control.run(&mut sandbox, &request(5)).expect("run");
        let err = outcome.check_answer(control.domain()).unwrap_err();
        assert_eq!(err, AnswerError::UnknownComponent("front-end".to_string()));
    }
}
