//! Prompt templates for the control loop and the code executor.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::answer::{OBSERVATION_EVIDENCE_CHARS, REASON_WORD_LIMIT};
use crate::io::domain::DomainContext;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const FORMAT_CONTRACT: &str = include_str!("prompts/format.md");
const REMINDER_TEMPLATE: &str = include_str!("prompts/reminder.md");
const FINALIZE_TEMPLATE: &str = include_str!("prompts/finalize.md");
const EXECUTOR_TEMPLATE: &str = include_str!("prompts/executor.md");
const EXECUTOR_RETRY_TEMPLATE: &str = include_str!("prompts/executor_retry.md");

/// Opening user turn of every diagnostic session.
pub const OPENING_TURN: &str = "Let's begin.";

/// Compiled template set, shared read-only by the loop and the bridge.
pub struct PromptSet {
    env: Environment<'static>,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptSet {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .expect("system template should be valid");
        env.add_template("reminder", REMINDER_TEMPLATE)
            .expect("reminder template should be valid");
        env.add_template("finalize", FINALIZE_TEMPLATE)
            .expect("finalize template should be valid");
        env.add_template("executor", EXECUTOR_TEMPLATE)
            .expect("executor template should be valid");
        env.add_template("executor_retry", EXECUTOR_RETRY_TEMPLATE)
            .expect("executor retry template should be valid");
        Self { env }
    }

    /// The JSON reply contract shown to the engine each step.
    pub fn format_contract(&self) -> &'static str {
        FORMAT_CONTRACT.trim()
    }

    pub fn system(&self, domain: &DomainContext, objective: &str) -> Result<String> {
        self.render(
            "system",
            context! {
                schema => domain.schema.trim(),
                rules => domain.rules.trim(),
                objective => objective.trim(),
                format => self.format_contract(),
            },
        )
    }

    pub fn reminder(&self, domain: &DomainContext, objective: &str) -> Result<String> {
        self.render(
            "reminder",
            context! {
                objective => objective.trim(),
                rules => domain.rules.trim(),
                format => self.format_contract(),
            },
        )
    }

    /// Finalization request; `exhausted` selects the "maximum steps reached" opening.
    pub fn finalize(&self, domain: &DomainContext, objective: &str, exhausted: bool) -> Result<String> {
        self.render(
            "finalize",
            context! {
                exhausted => exhausted,
                candidates => domain.candidates.trim(),
                objective => objective.trim(),
                reason_word_limit => REASON_WORD_LIMIT,
                evidence_chars => OBSERVATION_EVIDENCE_CHARS,
            },
        )
    }

    pub fn executor_system(&self, domain: &DomainContext) -> Result<String> {
        self.render(
            "executor",
            context! {
                schema => domain.schema.trim(),
            },
        )
    }

    pub fn executor_retry(&self, error: &str) -> Result<String> {
        self.render(
            "executor_retry",
            context! {
                error => error.trim(),
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("load {name} template"))?;
        template
            .render(ctx)
            .with_context(|| format!("render {name} template"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> DomainContext {
        DomainContext::new(
            "Check metrics before logs",
            "metric_container.csv: timestamp,cmdb_id,kpi_name,value",
            "## POSSIBLE ROOT CAUSE COMPONENTS:\n- frontend\n",
        )
    }

    #[test]
    fn system_prompt_embeds_domain_objective_and_format() {
        let prompts = PromptSet::new();
        let text = prompts
            .system(&domain(), "Find the root cause component")
            .expect("render");
        let schema_pos = text.find("metric_container.csv").expect("schema");
        let rules_pos = text.find("Check metrics before logs").expect("rules");
        let objective_pos = text.find("Find the root cause component").expect("objective");
        let format_pos = text.find("\"completed\":").expect("format");
        assert!(schema_pos < rules_pos);
        assert!(rules_pos < objective_pos);
        assert!(objective_pos < format_pos);
        assert!(text.trim_end().ends_with(OPENING_TURN));
    }

    #[test]
    fn reminder_restates_objective_rules_and_format() {
        let prompts = PromptSet::new();
        let text = prompts.reminder(&domain(), "objective X").expect("render");
        assert!(text.starts_with("Continue your reasoning process for the target issue:"));
        assert!(text.contains("objective X"));
        assert!(text.contains("Check metrics before logs."));
        assert!(text.contains("\"instruction\":"));
    }

    #[test]
    fn finalize_wording_depends_on_exhaustion() {
        let prompts = PromptSet::new();
        let decided = prompts.finalize(&domain(), "obj", false).expect("render");
        let exhausted = prompts.finalize(&domain(), "obj", true).expect("render");
        assert!(decided.starts_with("Now, you have decided to finish your reasoning process."));
        assert!(exhausted.starts_with("Now, the maximum steps of your reasoning have been reached."));
        for text in [&decided, &exhausted] {
            assert!(text.contains("- frontend"));
            assert!(text.contains("Recall the issue is: obj"));
            assert!(text.contains("\"reasoning_trace\""));
            assert!(text.contains("no more than 20 words"));
        }
    }

    #[test]
    fn executor_prompts_render() {
        let prompts = PromptSet::new();
        let system = prompts.executor_system(&domain()).expect("render");
        assert!(system.contains("metric_container.csv"));
        let retry = prompts
            .executor_retry("NameError: name 'df' is not defined\n")
            .expect("render");
        assert!(retry.contains("NameError: name 'df' is not defined\n```"));
    }
}
