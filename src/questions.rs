//! Questionnaire items and the question bank loader.
//!
//! Two on-disk formats are accepted and unified into [`Question`] at load time:
//! - plain text, one item per line, optionally suffixed with `" (Tests <trait>)"`
//! - a JSON array of `{question, trait, reverse}` objects (bare strings allowed)
//!
//! Plain-text items never carry trait metadata; the suffix is only an
//! annotation for human readers and is stripped before the item is sent.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Marker that starts the trailing annotation in plain-text banks.
const ANNOTATION_MARKER: &str = " (Tests";

#[derive(Debug, thiserror::Error)]
pub enum QuestionError {
    #[error("failed to read question bank {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse question bank {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("question bank {0} contains no questions")]
    Empty(String),
    #[error("question {index} has empty text")]
    BlankItem { index: usize },
}

/// One questionnaire item. Identity is its position in the bank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "question")]
    pub text: String,
    #[serde(rename = "trait", default, skip_serializing_if = "Option::is_none")]
    pub trait_name: Option<String>,
    #[serde(default)]
    pub reverse: bool,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            trait_name: None,
            reverse: false,
        }
    }

    pub fn with_trait(mut self, trait_name: impl Into<String>) -> Self {
        self.trait_name = Some(trait_name.into());
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Text sent to the model: the item with any `" (Tests..."` annotation removed.
    pub fn prompt_text(&self) -> &str {
        strip_annotation(&self.text)
    }
}

/// Remove a trailing `" (Tests ...)"` annotation.
pub fn strip_annotation(text: &str) -> &str {
    match text.find(ANNOTATION_MARKER) {
        Some(idx) => text[..idx].trim_end(),
        None => text,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawItem {
    Text(String),
    Object(Question),
}

/// Whether any item carries a trait label.
pub fn has_trait_metadata(questions: &[Question]) -> bool {
    questions.iter().any(|q| q.trait_name.is_some())
}

/// Load a question bank, detecting the format from its content.
pub fn load_questions(path: impl AsRef<Path>) -> Result<Vec<Question>, QuestionError> {
    let path = path.as_ref();
    let path_str = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| QuestionError::Io {
        path: path_str.clone(),
        source,
    })?;

    let questions = if raw.trim_start().starts_with('[') {
        parse_json_bank(&raw).map_err(|source| QuestionError::Json {
            path: path_str.clone(),
            source,
        })?
    } else {
        parse_text_bank(&raw)
    };

    if questions.is_empty() {
        return Err(QuestionError::Empty(path_str.clone()));
    }
    if let Some(index) = questions.iter().position(|q| q.text.trim().is_empty()) {
        return Err(QuestionError::BlankItem { index });
    }

    tracing::debug!(path = %path_str, count = questions.len(), "parsed question bank");
    Ok(questions)
}

/// Parse a line-oriented bank. Blank lines are skipped.
pub fn parse_text_bank(raw: &str) -> Vec<Question> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Question::new)
        .collect()
}

/// Parse a JSON array bank.
pub fn parse_json_bank(raw: &str) -> Result<Vec<Question>, serde_json::Error> {
    let items: Vec<RawItem> = serde_json::from_str(raw)?;
    Ok(items
        .into_iter()
        .map(|item| match item {
            RawItem::Text(text) => Question::new(text),
            RawItem::Object(mut q) => {
                q.trait_name = q
                    .trait_name
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty());
                q
            }
        })
        .collect())
}

/// Keep only the first `max` questions.
pub fn truncate_questions(questions: &mut Vec<Question>, max: Option<usize>) {
    if let Some(max) = max {
        if questions.len() > max {
            tracing::info!(kept = max, dropped = questions.len() - max, "truncating question bank");
            questions.truncate(max);
        }
    }
}
