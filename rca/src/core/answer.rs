//! Final-answer contract: schema shape plus candidate taxonomy membership.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::parser::unwrap_fenced;

const FINAL_ANSWER_SCHEMA: &str = include_str!("../../../schemas/final_answer.schema.json");

/// Soft limit on `reason` length; exceeding it is reported as a warning.
pub const REASON_WORD_LIMIT: usize = 20;
/// Leading characters of an observation expected to carry the key evidence.
pub const OBSERVATION_EVIDENCE_CHARS: usize = 20;

static FINAL_ANSWER_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(FINAL_ANSWER_SCHEMA).expect("final answer schema is valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("final answer schema compiles")
});

/// One entry of the answer's reasoning chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReasoningStep {
    pub step: u32,
    pub action: String,
    pub observation: String,
}

/// Structured diagnosis emitted by the finalization call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalAnswer {
    pub component: String,
    pub reason: String,
    pub reasoning_trace: Vec<ReasoningStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnswerError {
    #[error("answer is not valid JSON: {0}")]
    NotJson(String),
    #[error("answer violates the final answer schema:\n- {}", .0.join("\n- "))]
    Schema(Vec<String>),
    #[error("component `{0}` is not one of the candidate components")]
    UnknownComponent(String),
}

impl FinalAnswer {
    /// Parse raw answer text (fenced or not) and check it against the contract.
    pub fn parse(text: &str, taxonomy: &Taxonomy) -> Result<Self, AnswerError> {
        let value: Value = serde_json::from_str(unwrap_fenced(text))
            .map_err(|err| AnswerError::NotJson(err.to_string()))?;

        let violations: Vec<String> = FINAL_ANSWER_VALIDATOR
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !violations.is_empty() {
            return Err(AnswerError::Schema(violations));
        }

        let answer: FinalAnswer =
            serde_json::from_value(value).map_err(|err| AnswerError::NotJson(err.to_string()))?;
        if !taxonomy.contains_component(&answer.component) {
            return Err(AnswerError::UnknownComponent(answer.component));
        }
        Ok(answer)
    }

    /// Soft contract checks that do not invalidate the answer.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let words = self.reason.split_whitespace().count();
        if words > REASON_WORD_LIMIT {
            warnings.push(format!(
                "reason has {words} words (limit {REASON_WORD_LIMIT})"
            ));
        }
        if self.reasoning_trace.is_empty() {
            warnings.push("reasoning_trace is empty".to_string());
        }
        for (idx, step) in self.reasoning_trace.iter().enumerate() {
            if step.step as usize != idx + 1 {
                warnings.push(format!(
                    "reasoning_trace[{idx}] has step {} (expected {})",
                    step.step,
                    idx + 1
                ));
            }
            if step.observation.trim().is_empty() {
                warnings.push(format!("reasoning_trace[{idx}] has an empty observation"));
            }
        }
        warnings
    }
}

/// A heading of the candidate list and the items listed under it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TaxonomySection {
    heading: String,
    items: Vec<String>,
}

/// Candidate root causes parsed from the domain's markdown candidate list.
///
/// Headings start with `#`; candidates are `- item` bullet lines. Sections
/// whose heading mentions "reason" list reasons; every other bullet is a
/// candidate component (service, pod or node).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Taxonomy {
    sections: Vec<TaxonomySection>,
}

impl Taxonomy {
    pub fn parse(text: &str) -> Self {
        let mut sections: Vec<TaxonomySection> = Vec::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if let Some(heading) = trimmed.strip_prefix("## ") {
                sections.push(TaxonomySection {
                    heading: heading.trim().to_string(),
                    items: Vec::new(),
                });
                continue;
            }
            let Some(item) = trimmed
                .strip_prefix("- ")
                .or_else(|| trimmed.strip_prefix("* "))
            else {
                continue;
            };
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            if sections.is_empty() {
                sections.push(TaxonomySection {
                    heading: String::new(),
                    items: Vec::new(),
                });
            }
            if let Some(section) = sections.last_mut() {
                section.items.push(item.to_string());
            }
        }
        Self { sections }
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .filter(|section| !is_reason_heading(&section.heading))
            .flat_map(|section| section.items.iter().map(String::as_str))
    }

    pub fn reasons(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .filter(|section| is_reason_heading(&section.heading))
            .flat_map(|section| section.items.iter().map(String::as_str))
    }

    /// Case- and string-exact membership test.
    pub fn contains_component(&self, name: &str) -> bool {
        self.components().any(|candidate| candidate == name)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|section| section.items.is_empty())
    }
}

fn is_reason_heading(heading: &str) -> bool {
    heading.to_ascii_lowercase().contains("reason")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANDIDATES: &str = "## POSSIBLE ROOT CAUSE COMPONENTS:\n\
        # column: object_id\n\
        - frontend\n\
        - cartservice\n\
        \n\
        ## POSSIBLE ROOT CAUSE PODS:\n\
        - frontend-0\n\
        \n\
        ## POSSIBLE ROOT CAUSE NODES:\n\
        - aiops-k8s-01\n\
        \n\
        ## POSSIBLE ROOT CAUSE REASONS:\n\
        - CPU load\n\
        - network latency\n";

    fn answer_json(component: &str) -> String {
        format!(
            r#"{{"component": "{component}", "reason": "frontend CPU load high", "reasoning_trace": [{{"step": 1, "action": "QueryMetric(frontend)", "observation": "cpu_usage 98% on frontend"}}]}}"#
        )
    }

    #[test]
    fn taxonomy_splits_components_and_reasons() {
        let taxonomy = Taxonomy::parse(CANDIDATES);
        let components: Vec<&str> = taxonomy.components().collect();
        assert_eq!(
            components,
            vec!["frontend", "cartservice", "frontend-0", "aiops-k8s-01"]
        );
        let reasons: Vec<&str> = taxonomy.reasons().collect();
        assert_eq!(reasons, vec!["CPU load", "network latency"]);
    }

    #[test]
    fn component_match_is_exact() {
        let taxonomy = Taxonomy::parse(CANDIDATES);
        assert!(taxonomy.contains_component("frontend"));
        assert!(!taxonomy.contains_component("Frontend"));
        assert!(!taxonomy.contains_component("frontend-service"));
        assert!(!taxonomy.contains_component("CPU load"));
    }

    #[test]
    fn parses_fenced_valid_answer() {
        let taxonomy = Taxonomy::parse(CANDIDATES);
        let text = format!("```json\n{}\n```", answer_json("frontend"));
        let answer = FinalAnswer::parse(&text, &taxonomy).expect("valid answer");
        assert_eq!(answer.component, "frontend");
        assert_eq!(answer.reasoning_trace.len(), 1);
        assert!(answer.warnings().is_empty());
    }

    #[test]
    fn rejects_extra_top_level_fields() {
        let taxonomy = Taxonomy::parse(CANDIDATES);
        let text = r#"{"component": "frontend", "reason": "x", "reasoning_trace": [], "confidence": 0.9}"#;
        let err = FinalAnswer::parse(text, &taxonomy).unwrap_err();
        assert!(matches!(err, AnswerError::Schema(_)), "{err}");
    }

    #[test]
    fn rejects_component_outside_taxonomy() {
        let taxonomy = Taxonomy::parse(CANDIDATES);
        let err = FinalAnswer::parse(&answer_json("front-end"), &taxonomy).unwrap_err();
        assert_eq!(err, AnswerError::UnknownComponent("front-end".to_string()));
    }

    #[test]
    fn rejects_sentinel_text() {
        let taxonomy = Taxonomy::parse(CANDIDATES);
        let err =
            FinalAnswer::parse("Token length exceeds. No root cause found.", &taxonomy).unwrap_err();
        assert!(matches!(err, AnswerError::NotJson(_)));
    }

    #[test]
    fn warns_on_long_reason() {
        let answer = FinalAnswer {
            component: "frontend".to_string(),
            reason: "word ".repeat(25),
            reasoning_trace: vec![ReasoningStep {
                step: 1,
                action: "a".to_string(),
                observation: "o".to_string(),
            }],
        };
        let warnings = answer.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("25 words"));
    }
}
