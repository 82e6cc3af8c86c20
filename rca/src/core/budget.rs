//! Step budget shared by productive steps and retries.

/// Step counter for one loop run.
///
/// Every iteration consumes exactly one step, whether it executed an
/// instruction, recovered from a malformed reply, or recovered from an engine
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopBudget {
    max_step: u32,
    current_step: u32,
}

impl LoopBudget {
    pub fn new(max_step: u32) -> Self {
        Self {
            max_step,
            current_step: 0,
        }
    }

    /// Consume one step and return its 1-based index, or `None` when exhausted.
    pub fn next_step(&mut self) -> Option<u32> {
        if self.current_step >= self.max_step {
            return None;
        }
        self.current_step += 1;
        Some(self.current_step)
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn remaining(&self) -> u32 {
        self.max_step - self.current_step
    }
}
