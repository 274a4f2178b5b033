//! Structured response enforcement: every answer becomes `{score: 1..=5}`.
//!
//! Implements the contract between free-form provider replies and the
//! evaluation runner. Coercion is chosen per provider: forced tool calls where
//! the provider reliably honors them, prompt instruction plus best-effort
//! parsing elsewhere.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};
use crate::prompts;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 5;

/// Generation cap for a single rating.
pub const SCORE_MAX_OUTPUT_TOKENS: u32 = 256;

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("Invalid number regex"));

/// A scale bound after the score: "out of 5", "/5".
static SCALE_BOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\s*(?:/|\bout\s+of)\s*{MAX_SCORE}(?:\.0+)?\b"))
        .expect("Invalid scale bound regex")
});

/// A validated answer to one questionnaire item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub score: u8,
}

impl ScoreResponse {
    pub fn new(score: i64) -> Result<Self, InvocationError> {
        if !(i64::from(MIN_SCORE)..=i64::from(MAX_SCORE)).contains(&score) {
            return Err(InvocationError::Schema(format!(
                "score out of allowed range [{MIN_SCORE},{MAX_SCORE}]: {score}"
            )));
        }
        Ok(Self { score: score as u8 })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("schema violation: {0}")]
    Schema(String),
}

/// How a provider is made to emit the score schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoercionMode {
    /// Force a single `record_score` tool call and parse its arguments.
    ToolCalling,
    /// Instruct JSON-only output and parse the text reply.
    PromptJson,
}

impl CoercionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoercionMode::ToolCalling => "tool_calling",
            CoercionMode::PromptJson => "prompt_json",
        }
    }
}

impl fmt::Display for CoercionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoercionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tool_calling" | "function_calling" | "tools" => Ok(CoercionMode::ToolCalling),
            "prompt_json" | "json" | "prompt" => Ok(CoercionMode::PromptJson),
            other => Err(format!("unknown coercion mode '{other}'")),
        }
    }
}

/// A chat client whose every successful answer satisfies the score schema.
#[async_trait]
pub trait StructuredChatClient: Send + Sync {
    async fn ask(&self, question: &str) -> Result<ScoreResponse, InvocationError>;
}

/// [`StructuredChatClient`] over a provider gateway.
pub struct ScoringClient {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    temperature: f32,
    mode: CoercionMode,
    attribution: Attribution,
}

impl ScoringClient {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>, mode: CoercionMode) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: 0.0,
            mode,
            attribution: Attribution::new("structured::ask"),
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_attribution(mut self, attribution: Attribution) -> Self {
        self.attribution = attribution;
        self
    }

    fn build_request(&self, question: &str) -> ChatRequest {
        let prompt = prompts::render(question, self.mode == CoercionMode::PromptJson);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            self.attribution.clone(),
        )
        .temperature(self.temperature)
        .max_tokens(SCORE_MAX_OUTPUT_TOKENS);

        match self.mode {
            CoercionMode::ToolCalling => req.force_tool(prompts::score_tool()),
            CoercionMode::PromptJson => req.json(),
        }
    }
}

#[async_trait]
impl StructuredChatClient for ScoringClient {
    async fn ask(&self, question: &str) -> Result<ScoreResponse, InvocationError> {
        let req = self.build_request(question);
        let resp = self.gateway.chat(req).await?;
        tracing::debug!(
            model = %self.model,
            mode = %self.mode,
            finish_reason = ?resp.finish_reason,
            raw = resp.payload(),
            "raw model reply"
        );
        parse_score_reply(resp.payload())
    }
}

// =============================================================================
// Reply parsing
// =============================================================================

/// Parse a reply (tool arguments or text) into a [`ScoreResponse`].
///
/// Accepts a JSON object with a `score` field (possibly surrounded by text),
/// or free text containing exactly one number.
pub fn parse_score_reply(raw: &str) -> Result<ScoreResponse, InvocationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InvocationError::Schema("empty reply".into()));
    }

    if let Some(json_str) = extract_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json_str) {
            let score = value
                .get("score")
                .ok_or_else(|| InvocationError::Schema("missing 'score'".into()))?;
            return score_from_value(score);
        }
    }

    let unbounded = SCALE_BOUND.replace_all(trimmed, "");
    let numbers: Vec<&str> = NUMBER.find_iter(&unbounded).map(|m| m.as_str()).collect();
    match numbers.as_slice() {
        [] => Err(InvocationError::Schema(format!("no score in reply: {trimmed}"))),
        [single] => score_from_number_text(single),
        _ => Err(InvocationError::Schema(format!(
            "ambiguous reply ({} numbers): {trimmed}",
            numbers.len()
        ))),
    }
}

fn score_from_value(value: &serde_json::Value) -> Result<ScoreResponse, InvocationError> {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return ScoreResponse::new(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 => ScoreResponse::new(f as i64),
                _ => Err(InvocationError::Schema(format!("score is not an integer: {n}"))),
            }
        }
        serde_json::Value::String(s) => score_from_number_text(s.trim()),
        other => Err(InvocationError::Schema(format!(
            "score has invalid type: {other}"
        ))),
    }
}

fn score_from_number_text(s: &str) -> Result<ScoreResponse, InvocationError> {
    if let Ok(i) = s.parse::<i64>() {
        return ScoreResponse::new(i);
    }
    match s.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 => ScoreResponse::new(f as i64),
        _ => Err(InvocationError::Schema(format!("score is not an integer: {s}"))),
    }
}

/// Extract the first balanced JSON object from a reply.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let remainder = &raw[start..];
    let mut depth = 0;
    for (i, c) in remainder.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(raw: &str) -> u8 {
        parse_score_reply(raw).unwrap().score
    }

    #[test]
    fn parses_json_objects() {
        assert_eq!(score(r#"{"score": 4}"#), 4);
        assert_eq!(score(r#"Sure! {"score": 2} is my answer"#), 2);
        assert_eq!(score(r#"{"score": "5"}"#), 5);
        assert_eq!(score(r#"{"score": 3.0}"#), 3);
    }

    #[test]
    fn parses_bare_numbers() {
        assert_eq!(score("4"), 4);
        assert_eq!(score("  1.\n"), 1);
        assert_eq!(score("Score: 3"), 3);
    }

    #[test]
    fn scale_bound_after_score_is_ignored() {
        assert_eq!(score("4 out of 5"), 4);
        assert_eq!(score("I'd say 4/5"), 4);
        assert_eq!(score("2 / 5, mostly disagree"), 2);
        assert_eq!(score("5 Out Of 5.0"), 5);
        // Only the rubric's own bound is dropped.
        assert!(parse_score_reply("4 out of 10").is_err());
        assert!(parse_score_reply("3/4").is_err());
    }

    #[test]
    fn rejects_out_of_range_and_ambiguous() {
        assert!(matches!(
            parse_score_reply(r#"{"score": 0}"#),
            Err(InvocationError::Schema(_))
        ));
        assert!(parse_score_reply(r#"{"score": 6}"#).is_err());
        assert!(parse_score_reply(r#"{"score": 2.5}"#).is_err());
        assert!(parse_score_reply(r#"{"rating": 2}"#).is_err());
        assert!(parse_score_reply("between 3 and 4").is_err());
        assert!(parse_score_reply("no idea").is_err());
        assert!(parse_score_reply("   ").is_err());
        assert!(parse_score_reply("-2").is_err());
    }

    #[test]
    fn coercion_mode_names() {
        assert_eq!(
            "function_calling".parse::<CoercionMode>().unwrap(),
            CoercionMode::ToolCalling
        );
        assert_eq!(
            "prompt_json".parse::<CoercionMode>().unwrap(),
            CoercionMode::PromptJson
        );
        assert!("xml".parse::<CoercionMode>().is_err());
        assert_eq!(CoercionMode::ToolCalling.to_string(), "tool_calling");
    }

    #[test]
    fn score_response_bounds() {
        assert!(ScoreResponse::new(1).is_ok());
        assert!(ScoreResponse::new(5).is_ok());
        assert!(ScoreResponse::new(0).is_err());
        assert!(ScoreResponse::new(6).is_err());
    }
}
