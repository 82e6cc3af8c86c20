//! Stable exit codes for `rca` CLI commands.

/// Command succeeded; a final answer was produced (completed or forced).
pub const OK: i32 = 0;
/// Invalid input, config, domain files or environment, or an invalid answer.
pub const INVALID: i32 = 1;
/// The engine's context window overflowed; the sentinel answer was written.
pub const CONTEXT_OVERFLOW: i32 = 3;
/// The final-answer request kept failing; the finalize sentinel was written.
pub const FINALIZE_FAILED: i32 = 4;
