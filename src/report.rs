//! Report artifacts for an evaluation run.
//!
//! Every artifact is written independently: a failure on one is collected in
//! the [`ReportOutcome`] and does not stop the others.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::aggregate::{format_average, TraitAverages};
use crate::questions::{has_trait_metadata, Question};
use crate::runner::EvaluationResults;
use crate::structured::{MAX_SCORE, MIN_SCORE};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Minimum width of a model column in the trait table.
const MIN_SCORE_COLUMN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("json error on {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid results in {path}: {message}")]
    Invalid { path: String, message: String },
}

impl ReportError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ReportError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Current local time in the artifact timestamp format.
pub fn timestamp_now() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Artifact locations for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub evaluation_json: PathBuf,
    pub scores_csv: PathBuf,
    pub trait_averages_csv: PathBuf,
    pub errors_csv: PathBuf,
}

impl ReportPaths {
    pub fn new(dir: impl AsRef<Path>, timestamp: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            evaluation_json: dir.join(format!("evaluation_{timestamp}.json")),
            scores_csv: dir.join(format!("scores_{timestamp}.csv")),
            trait_averages_csv: dir.join(format!("trait_averages_{timestamp}.csv")),
            errors_csv: dir.join(format!("errors_{timestamp}.csv")),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReportOutcome {
    pub written: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, ReportError)>,
}

impl ReportOutcome {
    /// True when at least one artifact was attempted and none succeeded.
    pub fn all_failed(&self) -> bool {
        self.written.is_empty() && !self.failures.is_empty()
    }

    fn record(&mut self, path: &Path, result: Result<(), ReportError>) {
        match result {
            Ok(()) => {
                tracing::info!(path = %path.display(), "wrote report");
                self.written.push(path.to_path_buf());
            }
            Err(err) => {
                tracing::error!(path = %path.display(), "failed to write report: {err}");
                self.failures.push((path.to_path_buf(), err));
            }
        }
    }
}

/// Write all applicable artifacts under `dir`.
pub fn write_reports(
    results: &EvaluationResults,
    averages: &TraitAverages,
    dir: impl AsRef<Path>,
    timestamp: &str,
) -> ReportOutcome {
    let dir = dir.as_ref();
    let paths = ReportPaths::new(dir, timestamp);
    let mut outcome = ReportOutcome::default();

    let mut targets: Vec<(PathBuf, Option<String>)> = vec![
        (paths.evaluation_json.clone(), None),
        (paths.scores_csv.clone(), Some(render_scores_csv(results))),
    ];
    if !averages.is_empty() {
        targets.push((
            paths.trait_averages_csv.clone(),
            Some(render_trait_averages_csv(averages)),
        ));
    }
    if results.has_errors() {
        targets.push((paths.errors_csv.clone(), Some(render_errors_csv(results))));
    }

    if let Err(err) = std::fs::create_dir_all(dir) {
        let message = err.to_string();
        for (path, _) in targets {
            let source = std::io::Error::new(err.kind(), message.clone());
            outcome.record(&path, Err(ReportError::io(dir, source)));
        }
        return outcome;
    }

    for (path, body) in targets {
        let result = match body {
            None => write_results_json(&path, results),
            Some(body) => std::fs::write(&path, body).map_err(|e| ReportError::io(&path, e)),
        };
        outcome.record(&path, result);
    }
    outcome
}

pub fn write_results_json(path: &Path, results: &EvaluationResults) -> Result<(), ReportError> {
    let json = serde_json::to_string_pretty(results).map_err(|source| ReportError::Json {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, json).map_err(|e| ReportError::io(path, e))
}

/// Read an `evaluation_<ts>.json` artifact back.
pub fn load_results(path: impl AsRef<Path>) -> Result<EvaluationResults, ReportError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|e| ReportError::io(path, e))?;
    let results: EvaluationResults =
        serde_json::from_str(&raw).map_err(|source| ReportError::Json {
            path: path.display().to_string(),
            source,
        })?;
    validate_results(&results).map_err(|message| ReportError::Invalid {
        path: path.display().to_string(),
        message,
    })?;
    Ok(results)
}

/// Every model has one slot per question and every score is on the rubric scale.
fn validate_results(results: &EvaluationResults) -> Result<(), String> {
    let on_scale = |s: u8| (MIN_SCORE..=MAX_SCORE).contains(&s);
    let questions = results.questions.len();
    for evaluation in &results.model_evaluations {
        let model = &evaluation.model_name;
        if evaluation.responses.len() != questions {
            return Err(format!(
                "{model}: {} responses for {questions} questions",
                evaluation.responses.len()
            ));
        }
        if let Some((index, score)) = evaluation
            .responses
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.score.filter(|s| !on_scale(*s)).map(|s| (i, s)))
        {
            return Err(format!("{model}: score {score} at question {index} is outside {MIN_SCORE}-{MAX_SCORE}"));
        }
        for error in &evaluation.errors {
            if error.question_index >= questions {
                return Err(format!(
                    "{model}: error refers to question {} of {questions}",
                    error.question_index
                ));
            }
            if let Some(score) = error.default_score.filter(|s| !on_scale(*s)) {
                return Err(format!("{model}: default score {score} is outside {MIN_SCORE}-{MAX_SCORE}"));
            }
        }
    }
    Ok(())
}

// =============================================================================
// CSV
// =============================================================================

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn push_row<I, S>(out: &mut String, cells: I)
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let row: Vec<String> = cells.into_iter().map(|c| csv_field(c.as_ref())).collect();
    out.push_str(&row.join(","));
    out.push('\n');
}

fn question_cells(question: &Question, with_traits: bool) -> Vec<String> {
    let mut cells = vec![question.text.clone()];
    if with_traits {
        cells.push(question.trait_name.clone().unwrap_or_default());
        cells.push(question.reverse.to_string());
    }
    cells
}

/// `Question[,Trait,Reverse],<model>...`, one row per question.
pub fn render_scores_csv(results: &EvaluationResults) -> String {
    let with_traits = has_trait_metadata(&results.questions);
    let mut out = String::new();

    let mut header = vec!["Question".to_string()];
    if with_traits {
        header.extend(["Trait".to_string(), "Reverse".to_string()]);
    }
    header.extend(results.model_names().into_iter().map(str::to_string));
    push_row(&mut out, header);

    for (index, question) in results.questions.iter().enumerate() {
        let mut row = question_cells(question, with_traits);
        for evaluation in &results.model_evaluations {
            row.push(match evaluation.score_at(index) {
                Some(score) => score.to_string(),
                None => "N/A".to_string(),
            });
        }
        push_row(&mut out, row);
    }
    out
}

/// `Trait,<model>...`, one row per trait.
pub fn render_trait_averages_csv(averages: &TraitAverages) -> String {
    let mut out = String::new();
    push_row(
        &mut out,
        std::iter::once("Trait").chain(averages.models.iter().map(String::as_str)),
    );
    for (trait_name, cells) in averages.rows() {
        push_row(
            &mut out,
            std::iter::once(trait_name.to_string())
                .chain(cells.into_iter().map(format_average)),
        );
    }
    out
}

/// `Model,Question[,Trait,Reverse],Error`, one row per recorded error.
pub fn render_errors_csv(results: &EvaluationResults) -> String {
    let with_traits = has_trait_metadata(&results.questions);
    let mut out = String::new();

    let mut header = vec!["Model", "Question"];
    if with_traits {
        header.extend(["Trait", "Reverse"]);
    }
    header.push("Error");
    push_row(&mut out, header);

    for evaluation in &results.model_evaluations {
        for error in &evaluation.errors {
            let mut row = vec![evaluation.model_name.clone()];
            match results.questions.get(error.question_index) {
                Some(question) => row.extend(question_cells(question, with_traits)),
                None => {
                    row.push("Unknown".to_string());
                    if with_traits {
                        row.extend([String::new(), String::new()]);
                    }
                }
            }
            row.push(error.error.clone());
            push_row(&mut out, row);
        }
    }
    out
}

// =============================================================================
// Trait table
// =============================================================================

/// Boxed ASCII table of trait averages, one line per entry.
pub fn render_trait_table(averages: &TraitAverages) -> Vec<String> {
    let trait_width = averages
        .traits
        .iter()
        .map(|t| t.chars().count())
        .chain(std::iter::once("Trait".len()))
        .max()
        .unwrap_or(0);
    let widths: Vec<usize> = averages
        .models
        .iter()
        .map(|m| m.chars().count().max(MIN_SCORE_COLUMN))
        .collect();

    let mut separator = format!("+{}+", "-".repeat(trait_width + 2));
    for w in &widths {
        let _ = write!(separator, "{}+", "-".repeat(w + 2));
    }

    let mut header = format!("| {:<trait_width$} |", "Trait");
    for (model, w) in averages.models.iter().zip(&widths) {
        let _ = write!(header, " {model:<w$} |");
    }

    let mut lines = vec![separator.clone(), header, separator.clone()];
    for (trait_name, cells) in averages.rows() {
        let mut row = format!("| {trait_name:<trait_width$} |");
        for (cell, w) in cells.into_iter().zip(&widths) {
            let _ = write!(row, " {:<w$} |", format_average(cell));
        }
        lines.push(row);
    }
    lines.push(separator);
    lines
}

/// Log the trait table at info level.
pub fn log_trait_table(averages: &TraitAverages) {
    if averages.is_empty() {
        tracing::info!("no trait metadata in the question bank; skipping trait averages");
        return;
    }
    tracing::info!("===== PERSONALITY TRAIT AVERAGES =====");
    for line in render_trait_table(averages) {
        tracing::info!("{line}");
    }
}
