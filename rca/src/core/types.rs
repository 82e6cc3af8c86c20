//! Shared deterministic types for the diagnostic control loop.
//!
//! These types define stable contracts between the loop, the parser and the
//! persisted artifacts. They must not depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Speaker of a transcript turn (matches chat-completion role names).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single transcript turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Wire value of `completed` that marks a finished investigation.
pub const COMPLETED_TRUE: &str = "True";

/// One structurally valid step reply from the reasoning engine.
///
/// `completed` keeps the raw wire string so a parsed reply can be re-emitted
/// without loss; use [`StepResponse::is_completed`] for the decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResponse {
    pub analysis: Option<String>,
    pub completed: String,
    pub instruction: String,
}

impl StepResponse {
    /// Exact-string comparison against `"True"`; anything else is "not completed".
    pub fn is_completed(&self) -> bool {
        self.completed == COMPLETED_TRUE
    }
}

/// One executed instruction in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    /// 1-based loop iteration that produced this entry.
    pub step: u32,
    pub code: String,
    pub result: String,
}

/// Control-loop states. `Done` and `Fatal` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    AwaitingCompletionAnswer,
    ForcedTermination,
    Fatal,
    Done,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoopState::Done | LoopState::Fatal)
    }
}

/// Why a loop run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The engine declared the issue resolved and produced a final answer.
    Completed,
    /// The step budget ran out; a final answer was forced.
    StepsExhausted,
    /// The engine reported a context-size overflow; the sentinel was returned.
    ContextOverflow,
    /// Every final-answer request failed; the finalize sentinel was returned.
    FinalizeFailed,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Completed => "completed",
            Termination::StepsExhausted => "steps_exhausted",
            Termination::ContextOverflow => "context_overflow",
            Termination::FinalizeFailed => "finalize_failed",
        }
    }
}

/// Answer returned when the engine cannot accept more context.
pub const CONTEXT_OVERFLOW_ANSWER: &str = "Token length exceeds. No root cause found.";

/// Answer returned when the final-answer request keeps failing.
pub const FINALIZE_FAILED_ANSWER: &str = "Final answer request failed. No root cause found.";
