//! Evaluation runner: every model answers every question, in order.
//!
//! Calls are strictly sequential. A failed call is retried at most once (when
//! the policy asks for it) and may be papered over with a default score; no
//! per-call failure ever aborts the run.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::events::{EvalEvent, EventSink};
use crate::questions::Question;
use crate::structured::{StructuredChatClient, MAX_SCORE, MIN_SCORE};

/// Retry and fallback policy for failed calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationPolicy {
    /// Score recorded for a question whose call ultimately failed.
    /// Only honored when within 1..=5.
    pub default_error_score: Option<i64>,
    /// Invoke exactly once more after a failure.
    pub retry_failed: bool,
}

impl EvaluationPolicy {
    /// The fallback score, if configured and in range.
    pub fn fallback_score(&self) -> Option<u8> {
        self.default_error_score
            .filter(|s| (i64::from(MIN_SCORE)..=i64::from(MAX_SCORE)).contains(s))
            .map(|s| s as u8)
    }
}

/// Result of asking one model one question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Scored(u8),
    Failed {
        error: String,
        fallback_score: Option<u8>,
    },
}

impl ItemOutcome {
    /// The score usable for reports and aggregation, fallback included.
    pub fn usable_score(&self) -> Option<u8> {
        match self {
            ItemOutcome::Scored(s) => Some(*s),
            ItemOutcome::Failed { fallback_score, .. } => *fallback_score,
        }
    }
}

/// One response slot. `score` is `None` when the question yielded no score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResponse {
    pub score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    pub default_score: Option<u8>,
    pub question_index: usize,
}

/// Everything one model produced during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluation {
    pub model_name: String,
    pub model_version: String,
    /// Exactly one slot per question, index-aligned with the question list.
    pub responses: Vec<ItemResponse>,
    pub errors: Vec<ErrorRecord>,
    pub timestamp: DateTime<Local>,
}

impl ModelEvaluation {
    pub fn from_outcomes(
        model_name: impl Into<String>,
        model_version: impl Into<String>,
        outcomes: Vec<ItemOutcome>,
    ) -> Self {
        let mut responses = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::new();
        for (question_index, outcome) in outcomes.into_iter().enumerate() {
            responses.push(ItemResponse {
                score: outcome.usable_score(),
            });
            if let ItemOutcome::Failed {
                error,
                fallback_score,
            } = outcome
            {
                errors.push(ErrorRecord {
                    error,
                    default_score: fallback_score,
                    question_index,
                });
            }
        }
        Self {
            model_name: model_name.into(),
            model_version: model_version.into(),
            responses,
            errors,
            timestamp: Local::now(),
        }
    }

    /// Usable score for question `index`, if any.
    pub fn score_at(&self, index: usize) -> Option<u8> {
        self.responses.get(index).and_then(|r| r.score)
    }

    /// Number of questions that ended with a usable score.
    pub fn scored_count(&self) -> usize {
        self.responses.iter().filter(|r| r.score.is_some()).count()
    }
}

/// The terminal artifact of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub questions: Vec<Question>,
    pub model_versions: BTreeMap<String, String>,
    pub model_evaluations: Vec<ModelEvaluation>,
}

impl EvaluationResults {
    pub fn model_names(&self) -> Vec<&str> {
        self.model_evaluations
            .iter()
            .map(|e| e.model_name.as_str())
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.model_evaluations.iter().any(|e| !e.errors.is_empty())
    }
}

/// An initialized model ready to be evaluated.
#[derive(Clone)]
pub struct ModelClient {
    pub name: String,
    pub version: String,
    pub client: Arc<dyn StructuredChatClient>,
}

impl ModelClient {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        client: Arc<dyn StructuredChatClient>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            client,
        }
    }
}

/// Evaluate every model on every question and assemble the results.
pub async fn run_evaluation(
    questions: &[Question],
    models: &[ModelClient],
    policy: &EvaluationPolicy,
    sink: &dyn EventSink,
) -> EvaluationResults {
    sink.record(EvalEvent::RunStarted {
        models: models.iter().map(|m| m.name.clone()).collect(),
        questions: questions.len(),
    });

    let model_evaluations = run(questions, models, policy, sink).await;
    let model_versions = models
        .iter()
        .map(|m| (m.name.clone(), m.version.clone()))
        .collect();

    EvaluationResults {
        questions: questions.to_vec(),
        model_versions,
        model_evaluations,
    }
}

/// One [`ModelEvaluation`] per model, in model order.
pub async fn run(
    questions: &[Question],
    models: &[ModelClient],
    policy: &EvaluationPolicy,
    sink: &dyn EventSink,
) -> Vec<ModelEvaluation> {
    let mut evaluations = Vec::with_capacity(models.len());
    for model in models {
        evaluations.push(evaluate_model(questions, model, policy, sink).await);
    }
    evaluations
}

pub async fn evaluate_model(
    questions: &[Question],
    model: &ModelClient,
    policy: &EvaluationPolicy,
    sink: &dyn EventSink,
) -> ModelEvaluation {
    sink.record(EvalEvent::ModelStarted {
        model: model.name.clone(),
    });

    let mut outcomes = Vec::with_capacity(questions.len());
    for (index, question) in questions.iter().enumerate() {
        outcomes.push(evaluate_question(model, index, question, policy, sink).await);
    }

    let evaluation = ModelEvaluation::from_outcomes(&model.name, &model.version, outcomes);
    sink.record(EvalEvent::ModelFinished {
        model: model.name.clone(),
        scored: evaluation.scored_count(),
        errors: evaluation.errors.len(),
    });
    evaluation
}

/// Ask one question, applying the retry and fallback policy.
pub async fn evaluate_question(
    model: &ModelClient,
    index: usize,
    question: &Question,
    policy: &EvaluationPolicy,
    sink: &dyn EventSink,
) -> ItemOutcome {
    let text = question.prompt_text();
    let attempts = if policy.retry_failed { 2 } else { 1 };
    let mut last_error = String::new();

    for attempt in 0..attempts {
        sink.record(EvalEvent::QuestionSent {
            model: model.name.clone(),
            index,
            text: text.to_string(),
            attempt,
        });

        match model.client.ask(text).await {
            Ok(response) => {
                sink.record(EvalEvent::ModelResponse {
                    model: model.name.clone(),
                    index,
                    score: response.score,
                    attempt,
                });
                return ItemOutcome::Scored(response.score);
            }
            Err(err) => {
                last_error = err.to_string();
                sink.record(EvalEvent::CallFailed {
                    model: model.name.clone(),
                    index,
                    attempt,
                    error: last_error.clone(),
                });
            }
        }
    }

    let fallback_score = policy.fallback_score();
    match fallback_score {
        Some(score) => sink.record(EvalEvent::FallbackApplied {
            model: model.name.clone(),
            index,
            score,
        }),
        None => sink.record(EvalEvent::QuestionUnscored {
            model: model.name.clone(),
            index,
        }),
    }

    ItemOutcome::Failed {
        error: last_error,
        fallback_score,
    }
}
