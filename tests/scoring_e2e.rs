use std::sync::Arc;

use bigfive_eval::aggregate::aggregate;
use bigfive_eval::events::{FanoutEventSink, JsonlEventSink, TracingEventSink};
use bigfive_eval::gateway::{Attribution, GatewayConfig, NoopUsageSink};
use bigfive_eval::questions::load_questions;
use bigfive_eval::registry::{
    Credentials, ModelCatalog, ModelRegistry, ModelSelection, ProviderKind, RegistryError,
};
use bigfive_eval::report::{load_results, write_reports, ReportPaths};
use bigfive_eval::runner::{run_evaluation, EvaluationPolicy};
use bigfive_eval::structured::CoercionMode;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BANK: &str = r#"[
  {"question": "I am the life of the party", "trait": "Extraversion", "reverse": false},
  {"question": "I am reserved", "trait": "Extraversion", "reverse": true},
  {"question": "I get stressed out easily", "trait": "Neuroticism"}
]"#;

async fn openai_server(score: u8) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-openai"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "temperature": 0.0,
            "tool_choice": {"type": "function", "function": {"name": "record_score"}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"function": {"arguments": format!("{{\"score\": {score}}}")}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2 }
        })))
        .mount(&server)
        .await;
    server
}

async fn xai_server(reply: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-xai"))
        .and(body_partial_json(json!({
            "model": "grok-beta",
            "response_format": {"type": "json_object"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": reply },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 6 }
        })))
        .mount(&server)
        .await;
    server
}

fn write_bank(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("bank.json");
    std::fs::write(&path, BANK).unwrap();
    path
}

#[tokio::test]
async fn batch_run_scores_aggregates_and_writes_reports() {
    let openai = openai_server(4).await;
    let xai = xai_server("Sure. {\"score\": 2}").await;
    let dir = tempfile::tempdir().unwrap();
    let questions = load_questions(write_bank(dir.path())).unwrap();

    let credentials = Credentials::new()
        .with_key(ProviderKind::OpenAi, "sk-openai")
        .with_base_url(ProviderKind::OpenAi, openai.uri())
        .with_key(ProviderKind::Xai, "sk-xai")
        .with_base_url(ProviderKind::Xai, xai.uri());
    let registry = ModelRegistry::new(ModelCatalog::builtin(), credentials);

    let selection = ModelSelection::Batch(vec![
        "openai:gpt-4o-mini".into(),
        "anthropic:claude-3-opus".into(),
        "openai:gpt-5".into(),
        "xai:grok-beta".into(),
    ]);
    let initialized = registry
        .initialize(
            &selection,
            Arc::new(NoopUsageSink),
            &GatewayConfig::default(),
            &Attribution::new("test"),
        )
        .unwrap();
    assert_eq!(initialized.names(), vec!["GPT-4o-mini", "Grok"]);
    assert_eq!(initialized.skipped.len(), 2);
    assert!(matches!(
        initialized.skipped[0].reason,
        RegistryError::MissingCredential { .. }
    ));
    assert!(matches!(
        initialized.skipped[1].reason,
        RegistryError::UnknownModel(_)
    ));

    let (jsonl, worker) = JsonlEventSink::new(dir.path().join("logs/run.jsonl")).unwrap();
    let sink = FanoutEventSink::new()
        .with(Arc::new(TracingEventSink))
        .with(Arc::new(jsonl));
    let results = run_evaluation(
        &questions,
        &initialized.models,
        &EvaluationPolicy::default(),
        &sink,
    )
    .await;
    drop(sink);
    worker.join().unwrap();

    assert!(!results.has_errors());
    assert_eq!(
        results.model_versions["Grok"],
        "xAI API, grok-beta".to_string()
    );

    let averages = aggregate(&results);
    assert_eq!(averages.get("GPT-4o-mini", "Extraversion"), Some(3.0));
    assert_eq!(averages.get("GPT-4o-mini", "Neuroticism"), Some(4.0));
    assert_eq!(averages.get("Grok", "Extraversion"), Some(3.0));
    assert_eq!(averages.get("Grok", "Neuroticism"), Some(2.0));

    let out = dir.path().join("results");
    let outcome = write_reports(&results, &averages, &out, "20250101_000000");
    assert!(outcome.failures.is_empty());
    assert_eq!(outcome.written.len(), 3);

    let paths = ReportPaths::new(&out, "20250101_000000");
    let scores = std::fs::read_to_string(&paths.scores_csv).unwrap();
    assert_eq!(
        scores,
        "Question,Trait,Reverse,GPT-4o-mini,Grok\n\
         I am the life of the party,Extraversion,false,4,2\n\
         I am reserved,Extraversion,true,4,2\n\
         I get stressed out easily,Neuroticism,false,4,2\n"
    );
    let traits = std::fs::read_to_string(&paths.trait_averages_csv).unwrap();
    assert_eq!(
        traits,
        "Trait,GPT-4o-mini,Grok\nExtraversion,3.00,3.00\nNeuroticism,4.00,2.00\n"
    );
    assert!(!paths.errors_csv.exists());

    let reloaded = load_results(&paths.evaluation_json).unwrap();
    assert_eq!(reloaded.model_names(), vec!["GPT-4o-mini", "Grok"]);

    let log = std::fs::read_to_string(dir.path().join("logs/run.jsonl")).unwrap();
    let responses = log
        .lines()
        .filter(|l| l.contains("\"kind\":\"model_response\""))
        .count();
    assert_eq!(responses, 6);

    assert_eq!(openai.received_requests().await.unwrap().len(), 3);
    assert_eq!(xai.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn ambiguous_reply_becomes_default_scored_error() {
    let xai = xai_server("Somewhere between 2 and 4.").await;
    let dir = tempfile::tempdir().unwrap();
    let questions = load_questions(write_bank(dir.path())).unwrap();

    let credentials = Credentials::new()
        .with_key(ProviderKind::Xai, "sk-xai")
        .with_base_url(ProviderKind::Xai, xai.uri());
    let registry = ModelRegistry::new(ModelCatalog::builtin(), credentials);
    let initialized = registry
        .initialize(
            &ModelSelection::Single("xai:grok-beta".into()),
            Arc::new(NoopUsageSink),
            &GatewayConfig::default(),
            &Attribution::new("test"),
        )
        .unwrap();

    let policy = EvaluationPolicy {
        default_error_score: Some(3),
        retry_failed: true,
    };
    let results = run_evaluation(
        &questions,
        &initialized.models,
        &policy,
        &bigfive_eval::events::NoopEventSink,
    )
    .await;

    let eval = &results.model_evaluations[0];
    assert_eq!(eval.errors.len(), 3);
    assert!(eval.responses.iter().all(|r| r.score == Some(3)));
    // One retry per question.
    assert_eq!(xai.received_requests().await.unwrap().len(), 6);
}

#[test]
fn zero_initialized_models_is_fatal() {
    let registry = ModelRegistry::new(ModelCatalog::builtin(), Credentials::new());
    let result = registry.initialize(
        &ModelSelection::Single("anthropic:claude-3-opus".into()),
        Arc::new(NoopUsageSink),
        &GatewayConfig::default(),
        &Attribution::new("test"),
    );
    assert!(matches!(result, Err(RegistryError::NoModels)));
}

#[test]
fn only_credentialed_and_enabled_models_are_listed() {
    let credentials = Credentials::new()
        .with_key(ProviderKind::OpenAi, "sk-openai")
        .with_key(ProviderKind::Xai, "sk-xai");
    let registry = ModelRegistry::new(ModelCatalog::builtin(), credentials.clone());
    assert_eq!(
        registry.list_available_models(),
        vec!["openai:gpt-4o-mini", "xai:grok-beta"]
    );

    let registry = ModelRegistry::new(ModelCatalog::builtin(), credentials)
        .with_toggle("XAI_GROK_BETA_ENABLED", "false");
    assert_eq!(registry.list_available_models(), vec!["openai:gpt-4o-mini"]);
}

#[test]
fn provider_documents_replace_builtins_per_provider() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(
        models.join("openai.toml"),
        r#"
[models.gpt-4o]
display_name = "GPT-4o"
version = "OpenAI API, gpt-4o"
temperature = 0.3

[models.gpt-4o-mini]
display_name = "GPT-4o-mini"
version = "OpenAI API, gpt-4o-mini"
coercion = "prompt_json"
"#,
    )
    .unwrap();

    let catalog = ModelCatalog::load(dir.path()).unwrap();
    let keys: Vec<String> = catalog.specs().iter().map(|s| s.key()).collect();
    assert_eq!(
        keys,
        vec![
            "openai:gpt-4o",
            "openai:gpt-4o-mini",
            "anthropic:claude-3-opus",
            "xai:grok-beta"
        ]
    );
    let mini = catalog.find(ProviderKind::OpenAi, "gpt-4o-mini").unwrap();
    assert_eq!(mini.coercion, CoercionMode::PromptJson);
    assert_eq!(mini.model, "gpt-4o-mini");
    let four = catalog.find(ProviderKind::OpenAi, "gpt-4o").unwrap();
    assert_eq!(four.coercion, CoercionMode::ToolCalling);
    assert!((four.temperature - 0.3).abs() < f32::EPSILON);
}

#[test]
fn malformed_provider_document_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let models = dir.path().join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(models.join("xai.json"), "{ not json").unwrap();
    assert!(ModelCatalog::load(dir.path()).is_err());
}
