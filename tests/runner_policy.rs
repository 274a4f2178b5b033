use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bigfive_eval::aggregate::aggregate;
use bigfive_eval::events::{EvalEvent, EventSink, NoopEventSink};
use bigfive_eval::gateway::ProviderError;
use bigfive_eval::questions::Question;
use bigfive_eval::report::{render_errors_csv, render_scores_csv};
use bigfive_eval::runner::{run_evaluation, EvaluationPolicy, ModelClient};
use bigfive_eval::structured::{InvocationError, ScoreResponse, StructuredChatClient};

/// Replays a fixed script of outcomes and records every question it was asked.
struct ScriptedClient {
    script: Mutex<VecDeque<Result<u8, &'static str>>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new(script: Vec<Result<u8, &'static str>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            asked: Mutex::new(Vec::new()),
        })
    }

    fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl StructuredChatClient for ScriptedClient {
    async fn ask(&self, question: &str) -> Result<ScoreResponse, InvocationError> {
        self.asked.lock().unwrap().push(question.to_string());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(score)) => ScoreResponse::new(i64::from(score)),
            Some(Err(message)) => Err(InvocationError::Provider(ProviderError::provider(
                "fake", message, true,
            ))),
            None => Err(InvocationError::Schema("script exhausted".into())),
        }
    }
}

/// Fails every call.
struct FailingClient;

#[async_trait]
impl StructuredChatClient for FailingClient {
    async fn ask(&self, _question: &str) -> Result<ScoreResponse, InvocationError> {
        Err(InvocationError::Schema("no score in reply".into()))
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<EvalEvent>>,
}

impl EventSink for CollectingSink {
    fn record(&self, event: EvalEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn questions() -> Vec<Question> {
    vec![
        Question::new("I am talkative (Tests Extraversion)").with_trait("Extraversion"),
        Question::new("I worry a lot").with_trait("Neuroticism"),
        Question::new("I am reserved").with_trait("Extraversion").reversed(),
    ]
}

#[tokio::test]
async fn one_evaluation_per_model_in_order() {
    let a = ModelClient::new("A", "a-1", ScriptedClient::new(vec![Ok(1), Ok(2), Ok(3)]));
    let b = ModelClient::new("B", "b-1", ScriptedClient::new(vec![Ok(5), Ok(4), Ok(3)]));

    let results = run_evaluation(
        &questions(),
        &[a, b],
        &EvaluationPolicy::default(),
        &NoopEventSink,
    )
    .await;

    assert_eq!(results.model_names(), vec!["A", "B"]);
    assert_eq!(results.model_versions["B"], "b-1");
    assert_eq!(results.questions.len(), 3);
    for eval in &results.model_evaluations {
        assert_eq!(eval.responses.len(), 3);
        assert!(eval.errors.is_empty());
    }
    assert!(!results.has_errors());
}

#[tokio::test]
async fn failure_without_retry_or_default_leaves_sentinel_in_place() {
    let client = ScriptedClient::new(vec![Ok(4), Err("boom"), Ok(2)]);
    let model = ModelClient::new("M", "v", client.clone());

    let results = run_evaluation(
        &questions(),
        &[model],
        &EvaluationPolicy::default(),
        &NoopEventSink,
    )
    .await;

    let eval = &results.model_evaluations[0];
    assert_eq!(eval.score_at(0), Some(4));
    assert_eq!(eval.score_at(1), None);
    assert_eq!(eval.score_at(2), Some(2));
    assert_eq!(eval.errors.len(), 1);
    assert_eq!(eval.errors[0].question_index, 1);
    assert_eq!(eval.errors[0].default_score, None);
    assert!(eval.errors[0].error.contains("boom"));
    // No retry: three calls for three questions.
    assert_eq!(client.asked().len(), 3);

    // The third score still lands on the third question's trait.
    let averages = aggregate(&results);
    assert_eq!(averages.get("M", "Extraversion"), Some(4.0));
    assert_eq!(averages.get("M", "Neuroticism"), None);
}

#[tokio::test]
async fn retry_success_records_no_error() {
    let client = ScriptedClient::new(vec![Err("flaky"), Ok(3), Ok(3), Ok(3)]);
    let model = ModelClient::new("M", "v", client.clone());
    let sink = CollectingSink::default();
    let policy = EvaluationPolicy {
        default_error_score: None,
        retry_failed: true,
    };

    let results = run_evaluation(&questions(), &[model], &policy, &sink).await;

    let eval = &results.model_evaluations[0];
    assert!(eval.errors.is_empty());
    assert_eq!(eval.score_at(0), Some(3));
    assert_eq!(client.asked().len(), 4);

    let events = sink.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        EvalEvent::ModelResponse {
            index: 0,
            attempt: 1,
            score: 3,
            ..
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, EvalEvent::CallFailed { index: 0, attempt: 0, .. })));
}

#[tokio::test]
async fn retry_happens_at_most_once() {
    let client = ScriptedClient::new(vec![Err("one"), Err("two"), Ok(5), Ok(5), Ok(5)]);
    let model = ModelClient::new("M", "v", client.clone());
    let policy = EvaluationPolicy {
        default_error_score: None,
        retry_failed: true,
    };

    let results = run_evaluation(&questions(), &[model], &policy, &NoopEventSink).await;

    let eval = &results.model_evaluations[0];
    assert_eq!(eval.score_at(0), None);
    assert_eq!(eval.errors.len(), 1);
    assert!(eval.errors[0].error.contains("two"));
    assert_eq!(eval.score_at(1), Some(5));
    assert_eq!(client.asked().len(), 4);
}

#[tokio::test]
async fn default_score_fills_every_failed_question() {
    let model = ModelClient::new("Broken", "v0", Arc::new(FailingClient));
    let policy = EvaluationPolicy {
        default_error_score: Some(3),
        retry_failed: false,
    };
    let sink = CollectingSink::default();

    let results = run_evaluation(&questions(), &[model], &policy, &sink).await;

    let eval = &results.model_evaluations[0];
    assert_eq!(eval.scored_count(), 3);
    assert_eq!(eval.errors.len(), 3);
    assert!(eval.errors.iter().all(|e| e.default_score == Some(3)));

    let scores = render_scores_csv(&results);
    let lines: Vec<&str> = scores.lines().collect();
    assert_eq!(lines[0], "Question,Trait,Reverse,Broken");
    assert!(lines[1..].iter().all(|l| l.ends_with(",3")));

    let errors = render_errors_csv(&results);
    assert_eq!(errors.lines().count(), 4);
    assert!(errors
        .lines()
        .nth(2)
        .unwrap()
        .starts_with("Broken,I worry a lot,Neuroticism,false,"));

    let fallbacks = sink
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, EvalEvent::FallbackApplied { score: 3, .. }))
        .count();
    assert_eq!(fallbacks, 3);
}

#[tokio::test]
async fn out_of_range_default_is_ignored() {
    let model = ModelClient::new("Broken", "v0", Arc::new(FailingClient));
    let policy = EvaluationPolicy {
        default_error_score: Some(7),
        retry_failed: false,
    };

    let results = run_evaluation(&questions(), &[model], &policy, &NoopEventSink).await;

    let eval = &results.model_evaluations[0];
    assert_eq!(eval.scored_count(), 0);
    assert!(eval.errors.iter().all(|e| e.default_score.is_none()));
}

#[tokio::test]
async fn annotation_is_stripped_before_sending() {
    let client = ScriptedClient::new(vec![Ok(1), Ok(1), Ok(1)]);
    let model = ModelClient::new("M", "v", client.clone());

    run_evaluation(
        &questions(),
        &[model],
        &EvaluationPolicy::default(),
        &NoopEventSink,
    )
    .await;

    assert_eq!(client.asked()[0], "I am talkative");
}
