//! Extraction of structured step replies from raw engine text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::core::types::StepResponse;

const ANALYSIS_MARKER: &str = "\"analysis\":";
const COMPLETED_MARKER: &str = "\"completed\":";
const INSTRUCTION_MARKER: &str = "\"instruction\":";

const FORMAT_REQUEST: &str = "Please provide your analysis in requested JSON format.";
const MISSING_FIELDS_REQUEST: &str =
    "LLM response missing required fields. Please check your output format.";

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*\}|\[.*\])\s*```").expect("fence regex is valid")
});

/// Why a reply could not be turned into a [`StepResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("reply is missing one of the analysis/completed/instruction fields")]
    MissingMarkers,
    #[error("reply is not a valid JSON object: {0}")]
    InvalidJson(String),
    #[error("reply field `{0}` is missing or null")]
    MissingField(&'static str),
}

impl ParseError {
    /// User turn appended to the transcript to steer the engine back to the format.
    pub fn corrective_message(&self) -> String {
        match self {
            ParseError::MissingMarkers => FORMAT_REQUEST.to_string(),
            ParseError::InvalidJson(err) => format!("{err}\n{FORMAT_REQUEST}"),
            ParseError::MissingField(_) => MISSING_FIELDS_REQUEST.to_string(),
        }
    }
}

/// Return the inner content of a fenced JSON block, or the trimmed input when
/// the text is not fenced.
pub fn unwrap_fenced(text: &str) -> &str {
    match FENCED_JSON_RE.captures(text).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text.trim(),
    }
}

/// Parse one step reply.
///
/// The three field markers must appear literally before any structural parse
/// is attempted. `analysis` may be null; `completed` and `instruction` must be
/// present and non-null.
pub fn parse_step_response(raw: &str) -> Result<StepResponse, ParseError> {
    if !has_required_markers(raw) {
        return Err(ParseError::MissingMarkers);
    }

    let body = json_body(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|err| ParseError::InvalidJson(err.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ParseError::InvalidJson("expected a JSON object".to_string()))?;

    let analysis = match object.get("analysis") {
        None => return Err(ParseError::MissingField("analysis")),
        Some(Value::Null) => None,
        Some(other) => Some(text_of(other)),
    };
    let completed = required_text(object.get("completed"), "completed")?;
    let instruction = required_text(object.get("instruction"), "instruction")?;

    Ok(StepResponse {
        analysis,
        completed,
        instruction,
    })
}

fn has_required_markers(raw: &str) -> bool {
    [ANALYSIS_MARKER, COMPLETED_MARKER, INSTRUCTION_MARKER]
        .iter()
        .all(|marker| raw.contains(marker))
}

fn json_body(raw: &str) -> &str {
    let unwrapped = unwrap_fenced(raw);
    if unwrapped.starts_with('{') {
        return unwrapped;
    }
    match (unwrapped.find('{'), unwrapped.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unwrapped[start..=end],
        _ => unwrapped,
    }
}

fn required_text(value: Option<&Value>, field: &'static str) -> Result<String, ParseError> {
    match value {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(other) => Ok(text_of(other)),
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
