#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::Level;
use uuid::Uuid;

use bigfive_eval::aggregate::aggregate;
use bigfive_eval::config::BatchConfig;
use bigfive_eval::events::{FanoutEventSink, JsonlEventSink, TracingEventSink};
use bigfive_eval::gateway::{Attribution, GatewayConfig, TracingUsageSink};
use bigfive_eval::questions::{has_trait_metadata, load_questions, truncate_questions};
use bigfive_eval::registry::{Credentials, ModelCatalog, ModelRegistry, ModelSelection};
use bigfive_eval::report::{
    load_results, log_trait_table, render_trait_table, timestamp_now, write_reports,
};
use bigfive_eval::runner::{run_evaluation, EvaluationPolicy};
use bigfive_eval::telemetry::init_tracing;

const DEFAULT_QUESTIONS_JSON: &str = "prompts/bfi_subset.json";
const DEFAULT_QUESTIONS_TEXT: &str = "prompts/bfi_subset.txt";

#[derive(Parser)]
#[command(
    name = "bigfive",
    version,
    about = "Administer a Big Five questionnaire to LLM backends"
)]
struct Cli {
    /// Evaluate a single model (provider:model_id)
    #[arg(long, conflicts_with = "batch")]
    model: Option<String>,
    /// Batch document (JSON or TOML) with parameters and a model list
    #[arg(long)]
    batch: Option<PathBuf>,
    /// Print the models that can run with the current credentials and exit
    #[arg(long)]
    list_models: bool,
    /// Question bank (plain text or JSON)
    #[arg(long)]
    questions: Option<PathBuf>,
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
    /// Directory holding models/<provider>.{json,toml}
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    /// Score recorded for a question whose call failed (1-5)
    #[arg(long, allow_negative_numbers = true)]
    default_error_score: Option<i64>,
    /// Retry a failed question once
    #[arg(long)]
    retry_failed: bool,
    /// Only ask the first N questions
    #[arg(long)]
    max_questions: Option<usize>,
    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
    /// Print trait averages of a saved evaluation_<ts>.json and exit
    #[arg(long, value_name = "RESULTS_JSON")]
    summarize: Option<PathBuf>,
}

fn default_questions_path() -> PathBuf {
    let json = PathBuf::from(DEFAULT_QUESTIONS_JSON);
    if json.is_file() {
        json
    } else {
        PathBuf::from(DEFAULT_QUESTIONS_TEXT)
    }
}

fn list_models(config_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let catalog = ModelCatalog::load(config_dir)?;
    let registry = ModelRegistry::new(catalog, Credentials::from_env());
    for id in registry.list_available_models() {
        println!("{id}");
    }
    Ok(())
}

fn summarize(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let results = load_results(path)?;
    let averages = aggregate(&results);
    if averages.is_empty() {
        println!("no trait metadata in {}", path.display());
        return Ok(());
    }
    for line in render_trait_table(&averages) {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json, Level::INFO);

    if cli.list_models {
        return list_models(&cli.config_dir);
    }
    if let Some(path) = &cli.summarize {
        return summarize(path);
    }

    let questions_path = cli.questions.clone().unwrap_or_else(default_questions_path);
    let mut questions = load_questions(&questions_path)?;
    tracing::info!(
        path = %questions_path.display(),
        count = questions.len(),
        traits = has_trait_metadata(&questions),
        "loaded question bank"
    );

    let batch = cli.batch.as_deref().map(BatchConfig::from_path).transpose()?;

    let base_policy = EvaluationPolicy {
        default_error_score: cli.default_error_score,
        retry_failed: cli.retry_failed,
    };
    let policy = match &batch {
        Some(batch) => batch.policy(base_policy),
        None => base_policy,
    };
    if policy.default_error_score.is_some() && policy.fallback_score().is_none() {
        tracing::warn!(
            score = policy.default_error_score,
            "default error score outside 1-5 is ignored"
        );
    }

    let max_questions = batch
        .as_ref()
        .and_then(|b| b.parameters.max_questions_per_batch)
        .or(cli.max_questions);
    if matches!(max_questions, Some(0)) {
        return Err("--max-questions must be >= 1".into());
    }
    truncate_questions(&mut questions, max_questions);

    let catalog = ModelCatalog::load(&cli.config_dir)?;
    let registry = ModelRegistry::new(catalog, Credentials::from_env());
    let selection = ModelSelection::resolve(batch.as_ref(), cli.model.as_deref());

    let run_id = Uuid::new_v4();
    let attribution = Attribution::new("bigfive").with_run(run_id);
    let initialized = registry.initialize(
        &selection,
        Arc::new(TracingUsageSink),
        &GatewayConfig::default(),
        &attribution,
    )?;
    tracing::info!(
        %run_id,
        models = ?initialized.names(),
        skipped = initialized.skipped.len(),
        "models ready"
    );

    let timestamp = timestamp_now();
    let mut sink = FanoutEventSink::new().with(Arc::new(TracingEventSink));
    let log_path = cli.logs_dir.join(format!("evaluation_{timestamp}.jsonl"));
    let event_log = match JsonlEventSink::new(&log_path) {
        Ok((jsonl, worker)) => {
            sink = sink.with(Arc::new(jsonl));
            Some(worker)
        }
        Err(err) => {
            tracing::warn!(path = %log_path.display(), "event log disabled: {err}");
            None
        }
    };

    let results = run_evaluation(&questions, &initialized.models, &policy, &sink).await;
    drop(sink);
    if let Some(worker) = event_log {
        if let Err(err) = worker.join() {
            tracing::warn!("event log incomplete: {err}");
        }
    }

    let averages = aggregate(&results);
    let outcome = write_reports(&results, &averages, &cli.results_dir, &timestamp);
    log_trait_table(&averages);

    if outcome.all_failed() {
        return Err(format!(
            "no report could be written to {}",
            cli.results_dir.display()
        )
        .into());
    }
    tracing::info!(
        written = outcome.written.len(),
        failed = outcome.failures.len(),
        "results saved"
    );
    Ok(())
}
