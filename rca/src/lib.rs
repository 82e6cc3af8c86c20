//! Diagnostic control loop for root-cause analysis over telemetry.
//!
//! A reasoning engine and a code-execution sandbox take turns until the
//! engine declares a diagnosis or the step budget runs out. The crate keeps
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (reply parsing, transcript,
//!   trajectory, step budget, answer contract). No I/O.
//! - **[`io`]**: Side-effecting boundaries (HTTP engine, Python sandbox,
//!   execution bridge, config, artifacts). Traits at each seam allow
//!   scripted doubles in tests.
//!
//! [`control`] ties them together; [`run`] wires the CLI commands.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
