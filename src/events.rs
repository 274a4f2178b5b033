//! Evaluation event capture.
//!
//! The runner never logs through a global logger directly; it reports
//! [`EvalEvent`]s to an injected [`EventSink`]. Model replies are a distinct
//! event kind so they can be filtered or colored separately.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Target used for model-response tracing events.
pub const MODEL_RESPONSE_TARGET: &str = "model_response";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalEvent {
    RunStarted {
        models: Vec<String>,
        questions: usize,
    },
    ModelStarted {
        model: String,
    },
    QuestionSent {
        model: String,
        index: usize,
        text: String,
        attempt: u32,
    },
    ModelResponse {
        model: String,
        index: usize,
        score: u8,
        attempt: u32,
    },
    CallFailed {
        model: String,
        index: usize,
        attempt: u32,
        error: String,
    },
    FallbackApplied {
        model: String,
        index: usize,
        score: u8,
    },
    QuestionUnscored {
        model: String,
        index: usize,
    },
    ModelFinished {
        model: String,
        scored: usize,
        errors: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: EvalEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _event: EvalEvent) {}
}

/// Forwards events to `tracing` at a level matching their severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: EvalEvent) {
        match event {
            EvalEvent::RunStarted { models, questions } => {
                tracing::info!(models = ?models, questions, "starting evaluation");
            }
            EvalEvent::ModelStarted { model } => {
                tracing::info!(%model, "evaluating model");
            }
            EvalEvent::QuestionSent {
                model,
                index,
                text,
                attempt,
            } => {
                tracing::info!(%model, index, attempt, "sending question: '{text}'");
            }
            EvalEvent::ModelResponse {
                model,
                index,
                score,
                attempt,
            } => {
                tracing::info!(
                    target: MODEL_RESPONSE_TARGET,
                    %model,
                    index,
                    attempt,
                    score,
                    "response from {model}: score={score}"
                );
            }
            EvalEvent::CallFailed {
                model,
                index,
                attempt,
                error,
            } => {
                tracing::error!(%model, index, attempt, "error querying {model}: {error}");
            }
            EvalEvent::FallbackApplied {
                model,
                index,
                score,
            } => {
                tracing::warn!(%model, index, score, "using default error score");
            }
            EvalEvent::QuestionUnscored { model, index } => {
                tracing::warn!(%model, index, "question left without a score");
            }
            EvalEvent::ModelFinished {
                model,
                scored,
                errors,
            } => {
                tracing::info!(%model, scored, errors, "model finished");
            }
        }
    }
}

/// Sends every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutEventSink {
    fn record(&self, event: EvalEvent) {
        for sink in &self.sinks {
            sink.record(event.clone());
        }
    }
}

// =============================================================================
// JSONL sink
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("event log worker failed: {0}")]
    Join(String),
}

#[derive(Serialize)]
struct EventLine<'a> {
    timestamp_ms: i64,
    #[serde(flatten)]
    event: &'a EvalEvent,
}

/// Appends events as JSON lines from a background writer thread.
#[derive(Clone)]
pub struct JsonlEventSink {
    sender: mpsc::Sender<(i64, EvalEvent)>,
}

pub struct EventLogWorker {
    handle: Option<std::thread::JoinHandle<Result<(), EventLogError>>>,
}

impl EventLogWorker {
    /// Wait for the writer to drain. Drop every sender clone first.
    pub fn join(mut self) -> Result<(), EventLogError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(EventLogError::Join("event log worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlEventSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, EventLogWorker), EventLogError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<(i64, EvalEvent)>();
        let handle = std::thread::spawn(move || write_event_loop(file, receiver));
        Ok((
            Self { sender },
            EventLogWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl EventSink for JsonlEventSink {
    fn record(&self, event: EvalEvent) {
        // The worker only disappears on an io failure, which join() reports.
        let _ = self.sender.send((now_epoch_ms(), event));
    }
}

fn write_event_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<(i64, EvalEvent)>,
) -> Result<(), EventLogError> {
    let mut writer = BufWriter::new(file);
    for (timestamp_ms, event) in receiver {
        let line = serde_json::to_string(&EventLine {
            timestamp_ms,
            event: &event,
        })
        .map_err(|e| EventLogError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kind_tag() {
        let v = serde_json::to_value(EvalEvent::ModelResponse {
            model: "Grok".into(),
            index: 3,
            score: 4,
            attempt: 1,
        })
        .unwrap();
        assert_eq!(v["kind"], "model_response");
        assert_eq!(v["score"], 4);
        assert_eq!(v["attempt"], 1);
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let (sink, worker) = JsonlEventSink::new(&path).unwrap();
        sink.record(EvalEvent::ModelStarted {
            model: "GPT-4o-mini".into(),
        });
        sink.record(EvalEvent::QuestionUnscored {
            model: "GPT-4o-mini".into(),
            index: 0,
        });
        drop(sink);
        worker.join().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "model_started");
        assert_eq!(lines[1]["kind"], "question_unscored");
        assert!(lines[1]["timestamp_ms"].as_i64().unwrap() > 0);
    }
}
