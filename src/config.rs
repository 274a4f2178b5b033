//! Batch and per-provider model configuration documents.
//!
//! Documents are JSON or TOML, chosen by file extension (`.toml` is TOML,
//! anything else is JSON).

use std::collections::BTreeMap;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::runner::EvaluationPolicy;
use crate::structured::CoercionMode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("invalid config {path}: {message}")]
    Invalid { path: String, message: String },
}

/// Run parameters of a batch document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchParameters {
    /// Keep only the first N questions.
    #[serde(default)]
    pub max_questions_per_batch: Option<usize>,
    #[serde(default)]
    pub default_error_score: Option<i64>,
    #[serde(default)]
    pub retry_failed: Option<bool>,
}

/// A batch document: parameters plus an ordered model selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default)]
    pub parameters: BatchParameters,
    /// `provider:model_id` entries, in evaluation order.
    #[serde(default)]
    pub models: Vec<String>,
}

impl BatchConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config: BatchConfig = load_document(path)?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        if matches!(self.parameters.max_questions_per_batch, Some(0)) {
            return Err(ConfigError::Invalid {
                path: path.display().to_string(),
                message: "max_questions_per_batch must be >= 1".to_string(),
            });
        }
        if let Some(score) = self.parameters.default_error_score {
            if !(1..=5).contains(&score) {
                tracing::warn!(
                    score,
                    "default_error_score outside 1-5; failed questions will stay unscored"
                );
            }
        }
        Ok(())
    }

    /// Policy from this document, with unset fields taken from `base`.
    pub fn policy(&self, base: EvaluationPolicy) -> EvaluationPolicy {
        EvaluationPolicy {
            default_error_score: self
                .parameters
                .default_error_score
                .or(base.default_error_score),
            retry_failed: self.parameters.retry_failed.unwrap_or(base.retry_failed),
        }
    }
}

/// One model entry of a provider document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub display_name: String,
    pub version: String,
    /// Provider-side model name; defaults to the entry's id.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    /// Overrides the provider's default coercion mode.
    #[serde(default)]
    pub coercion: Option<CoercionMode>,
    /// Environment variable that can disable this model (`false`/`0`/`no`/`off`).
    #[serde(default)]
    pub enabled_env: Option<String>,
}

/// A per-provider document: `models.<model_id> = ModelEntry`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderModelsFile {
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,
}

/// Load a JSON or TOML document.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let path_str = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path_str.clone(),
        source,
    })?;
    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    parse_document(&raw, is_toml).map_err(|message| ConfigError::Parse {
        path: path_str,
        message,
    })
}

fn parse_document<T: DeserializeOwned>(raw: &str, is_toml: bool) -> Result<T, String> {
    if is_toml {
        toml::from_str(raw).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(raw).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_json_parses_parameters_and_models() {
        let cfg: BatchConfig = parse_document(
            r#"{
                "parameters": {"max_questions_per_batch": 10, "default_error_score": 3, "retry_failed": true},
                "models": ["openai:gpt-4o-mini", "xai:grok-beta"]
            }"#,
            false,
        )
        .unwrap();
        assert_eq!(cfg.parameters.max_questions_per_batch, Some(10));
        assert_eq!(cfg.models, vec!["openai:gpt-4o-mini", "xai:grok-beta"]);
        let policy = cfg.policy(EvaluationPolicy::default());
        assert_eq!(policy.default_error_score, Some(3));
        assert!(policy.retry_failed);
    }

    #[test]
    fn batch_toml_parses_and_falls_back_to_base_policy() {
        let cfg: BatchConfig = parse_document(
            r#"
models = ["anthropic:claude-3-opus"]

[parameters]
max_questions_per_batch = 5
"#,
            true,
        )
        .unwrap();
        assert_eq!(cfg.parameters.max_questions_per_batch, Some(5));
        let base = EvaluationPolicy {
            default_error_score: Some(2),
            retry_failed: true,
        };
        assert_eq!(cfg.policy(base), base);
    }

    #[test]
    fn empty_batch_document_is_all_defaults() {
        let cfg: BatchConfig = parse_document("{}", false).unwrap();
        assert_eq!(cfg, BatchConfig::default());
    }

    #[test]
    fn provider_file_reads_entries() {
        let file: ProviderModelsFile = parse_document(
            r#"
[models.gpt-4o]
display_name = "GPT-4o"
version = "OpenAI API, gpt-4o"
temperature = 0.2
coercion = "prompt_json"
enabled_env = "USE_GPT4O"
"#,
            true,
        )
        .unwrap();
        let entry = &file.models["gpt-4o"];
        assert_eq!(entry.display_name, "GPT-4o");
        assert_eq!(entry.model, None);
        assert_eq!(entry.coercion, Some(CoercionMode::PromptJson));
        assert_eq!(entry.enabled_env.as_deref(), Some("USE_GPT4O"));
    }

    #[test]
    fn zero_question_limit_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");
        std::fs::write(&path, r#"{"parameters": {"max_questions_per_batch": 0}}"#).unwrap();
        assert!(matches!(
            BatchConfig::from_path(&path),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
