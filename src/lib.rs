#![forbid(unsafe_code)]

//! # bigfive-eval
//!
//! Administer a Big Five personality questionnaire to chat-model backends and
//! aggregate the answers into per-trait scores.
//!
//! Each model answers every item on a 1-5 agreement scale. Replies are forced
//! into a `{"score": n}` shape (a forced tool call where the provider supports
//! it, a JSON-only instruction otherwise), failures are retried or defaulted per
//! policy, and reverse-keyed items are flipped before averaging.
//!
//! Flow: questions -> registry -> runner -> aggregate -> report.

pub mod aggregate;
pub mod config;
pub mod events;
pub mod gateway;
pub mod prompts;
pub mod questions;
pub mod registry;
pub mod report;
pub mod runner;
pub mod structured;
pub mod telemetry;

pub use aggregate::{aggregate, reverse_transform, TraitAverages};
pub use config::{BatchConfig, ConfigError};
pub use events::{
    EvalEvent, EventSink, FanoutEventSink, JsonlEventSink, NoopEventSink, TracingEventSink,
};
pub use gateway::{Attribution, ChatGateway, GatewayConfig, ProviderError, ProviderGateway, UsageSink};
pub use questions::{load_questions, Question, QuestionError};
pub use registry::{
    Credentials, ModelCatalog, ModelRegistry, ModelSelection, ProviderKind, RegistryError,
};
pub use report::{load_results, write_reports, ReportError, ReportOutcome};
pub use runner::{
    run_evaluation, EvaluationPolicy, EvaluationResults, ModelClient, ModelEvaluation,
};
pub use structured::{
    CoercionMode, InvocationError, ScoreResponse, ScoringClient, StructuredChatClient,
};
