use rca::exit_codes;
use serde::{Deserialize, Serialize};

use crate::child::ChildStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    ContextOverflow,
    Timeout,
    Error,
}

pub fn classify_outcome(status: &ChildStatus) -> Outcome {
    if status.timed_out {
        return Outcome::Timeout;
    }
    match status.exit_code {
        Some(exit_codes::OK) => Outcome::Completed,
        Some(exit_codes::CONTEXT_OVERFLOW) => Outcome::ContextOverflow,
        Some(_) | None => Outcome::Error,
    }
}
