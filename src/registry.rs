//! Model registry: which models exist, which can run, and how to build them.
//!
//! Providers form a closed set ([`ProviderKind`]); a static table maps each one
//! to its credential variable, base-URL override, default coercion mode and
//! adapter constructor. Models come from per-provider config documents or the
//! built-in defaults.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{load_document, BatchConfig, ConfigError, ModelEntry, ProviderModelsFile};
use crate::gateway::anthropic::{AnthropicAdapter, ANTHROPIC_BASE_URL};
use crate::gateway::openai::{OpenAiCompatAdapter, OPENAI_BASE_URL, XAI_BASE_URL};
use crate::gateway::{
    Attribution, ChatProvider, GatewayConfig, ProviderError, ProviderGateway, UsageSink,
};
use crate::runner::ModelClient;
use crate::structured::{CoercionMode, ScoringClient};

pub const TIMEOUT_ENV: &str = "BIGFIVE_TIMEOUT_SECONDS";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Providers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Xai,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Xai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Xai => "xai",
        }
    }

    fn entry(&self) -> &'static ProviderEntry {
        match self {
            ProviderKind::OpenAi => &PROVIDERS[0],
            ProviderKind::Anthropic => &PROVIDERS[1],
            ProviderKind::Xai => &PROVIDERS[2],
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        self.entry().api_key_env
    }

    pub fn base_url_env(&self) -> &'static str {
        self.entry().base_url_env
    }

    pub fn default_base_url(&self) -> &'static str {
        self.entry().default_base_url
    }

    /// OpenAI and Anthropic only emit the schema reliably through forced tools.
    pub fn default_coercion(&self) -> CoercionMode {
        self.entry().default_coercion
    }

    pub fn build_adapter(&self, params: &ClientParams) -> Result<Arc<dyn ChatProvider>, ProviderError> {
        (self.entry().build)(params)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or(RegistryError::UnknownProvider(s))
    }
}

/// Connection parameters handed to an adapter constructor.
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

struct ProviderEntry {
    api_key_env: &'static str,
    base_url_env: &'static str,
    default_base_url: &'static str,
    default_coercion: CoercionMode,
    build: fn(&ClientParams) -> Result<Arc<dyn ChatProvider>, ProviderError>,
}

static PROVIDERS: [ProviderEntry; 3] = [
    ProviderEntry {
        api_key_env: "OPENAI_API_KEY",
        base_url_env: "OPENAI_BASE_URL",
        default_base_url: OPENAI_BASE_URL,
        default_coercion: CoercionMode::ToolCalling,
        build: build_openai,
    },
    ProviderEntry {
        api_key_env: "ANTHROPIC_API_KEY",
        base_url_env: "ANTHROPIC_BASE_URL",
        default_base_url: ANTHROPIC_BASE_URL,
        default_coercion: CoercionMode::ToolCalling,
        build: build_anthropic,
    },
    ProviderEntry {
        api_key_env: "XAI_API_KEY",
        base_url_env: "XAI_BASE_URL",
        default_base_url: XAI_BASE_URL,
        default_coercion: CoercionMode::PromptJson,
        build: build_xai,
    },
];

fn build_openai(p: &ClientParams) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let adapter = OpenAiCompatAdapter::with_config("openai", &p.api_key, &p.base_url, p.timeout)?;
    Ok(Arc::new(adapter))
}

fn build_anthropic(p: &ClientParams) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let adapter = AnthropicAdapter::with_config(&p.api_key, &p.base_url, p.timeout)?;
    Ok(Arc::new(adapter))
}

fn build_xai(p: &ClientParams) -> Result<Arc<dyn ChatProvider>, ProviderError> {
    let adapter = OpenAiCompatAdapter::with_config("xai", &p.api_key, &p.base_url, p.timeout)?;
    Ok(Arc::new(adapter))
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("malformed model selection '{0}' (expected provider:model_id)")]
    Malformed(String),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("{entry}: {env} is not set")]
    MissingCredential { entry: String, env: &'static str },
    #[error("{entry}: disabled by {env}")]
    Disabled { entry: String, env: String },
    #[error("{entry}: display name '{name}' is already in use")]
    Duplicate { entry: String, name: String },
    #[error("{entry}: failed to build client: {source}")]
    Client {
        entry: String,
        source: ProviderError,
    },
    #[error("no models could be initialized")]
    NoModels,
}

// =============================================================================
// Model specs
// =============================================================================

/// An evaluable model, identified by `provider:model_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub display_name: String,
    pub version: String,
    /// Provider-side model name.
    pub model: String,
    pub temperature: f32,
    pub coercion: CoercionMode,
    /// Environment variable that can force-disable this model.
    pub enabled_env: String,
}

impl ModelSpec {
    pub fn from_entry(provider: ProviderKind, model_id: &str, entry: &ModelEntry) -> Self {
        Self {
            provider,
            model_id: model_id.to_string(),
            display_name: entry.display_name.clone(),
            version: entry.version.clone(),
            model: entry.model.clone().unwrap_or_else(|| model_id.to_string()),
            temperature: entry.temperature,
            coercion: entry.coercion.unwrap_or_else(|| provider.default_coercion()),
            enabled_env: entry
                .enabled_env
                .clone()
                .unwrap_or_else(|| default_enabled_env(provider, model_id)),
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.model_id)
    }
}

/// `OPENAI_GPT_4O_MINI_ENABLED` for `openai:gpt-4o-mini`.
pub fn default_enabled_env(provider: ProviderKind, model_id: &str) -> String {
    let id: String = model_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}_ENABLED", provider.as_str().to_ascii_uppercase(), id)
}

/// Split a `provider:model_id` selection string.
pub fn parse_selection(entry: &str) -> Result<(ProviderKind, String), RegistryError> {
    let (provider, model_id) = entry
        .split_once(':')
        .ok_or_else(|| RegistryError::Malformed(entry.to_string()))?;
    let model_id = model_id.trim();
    if model_id.is_empty() || provider.trim().is_empty() {
        return Err(RegistryError::Malformed(entry.to_string()));
    }
    Ok((provider.parse()?, model_id.to_string()))
}

/// Every known model, in provider order then config order.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    specs: Vec<ModelSpec>,
}

impl ModelCatalog {
    pub fn new(specs: Vec<ModelSpec>) -> Self {
        Self { specs }
    }

    /// The default set used when no provider document exists.
    pub fn builtin() -> Self {
        let specs = ProviderKind::ALL
            .into_iter()
            .flat_map(|kind| {
                builtin_entries(kind)
                    .into_iter()
                    .map(move |(id, entry)| ModelSpec::from_entry(kind, id, &entry))
            })
            .collect();
        Self { specs }
    }

    /// Read `<config_dir>/models/<provider>.{json,toml}`; providers without a
    /// document keep their built-in models.
    pub fn load(config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let models_dir = config_dir.as_ref().join("models");
        let mut specs = Vec::new();
        for kind in ProviderKind::ALL {
            let document = ["json", "toml"]
                .iter()
                .map(|ext| models_dir.join(format!("{}.{ext}", kind.as_str())))
                .find(|p| p.is_file());

            match document {
                Some(path) => {
                    let file: ProviderModelsFile = load_document(&path)?;
                    tracing::debug!(
                        provider = kind.as_str(),
                        path = %path.display(),
                        models = file.models.len(),
                        "loaded provider model config"
                    );
                    specs.extend(
                        file.models
                            .iter()
                            .map(|(id, entry)| ModelSpec::from_entry(kind, id, entry)),
                    );
                }
                None => specs.extend(
                    builtin_entries(kind)
                        .into_iter()
                        .map(|(id, entry)| ModelSpec::from_entry(kind, id, &entry)),
                ),
            }
        }
        Ok(Self { specs })
    }

    pub fn specs(&self) -> &[ModelSpec] {
        &self.specs
    }

    pub fn find(&self, provider: ProviderKind, model_id: &str) -> Option<&ModelSpec> {
        self.specs
            .iter()
            .find(|s| s.provider == provider && s.model_id == model_id)
    }
}

fn builtin_entries(kind: ProviderKind) -> Vec<(&'static str, ModelEntry)> {
    let entry = |display_name: &str, version: &str, model: &str| ModelEntry {
        display_name: display_name.to_string(),
        version: version.to_string(),
        model: Some(model.to_string()),
        temperature: 0.0,
        coercion: None,
        enabled_env: None,
    };
    match kind {
        ProviderKind::OpenAi => vec![(
            "gpt-4o-mini",
            entry("GPT-4o-mini", "OpenAI API, gpt-4o-mini", "gpt-4o-mini"),
        )],
        ProviderKind::Anthropic => vec![(
            "claude-3-opus",
            entry(
                "Claude 3",
                "Anthropic API, claude-3-opus-20240229",
                "claude-3-opus-20240229",
            ),
        )],
        ProviderKind::Xai => vec![(
            "grok-beta",
            entry("Grok", "xAI API, grok-beta", "grok-beta"),
        )],
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Provider API keys and endpoint overrides.
#[derive(Debug, Clone)]
pub struct Credentials {
    api_keys: HashMap<ProviderKind, String>,
    base_urls: HashMap<ProviderKind, String>,
    timeout: Duration,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            api_keys: HashMap::new(),
            base_urls: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        let mut creds = Self::default();
        for kind in ProviderKind::ALL {
            if let Some(key) = non_empty_env(kind.api_key_env()) {
                creds.api_keys.insert(kind, key);
            }
            if let Some(url) = non_empty_env(kind.base_url_env()) {
                creds.base_urls.insert(kind, url);
            }
        }
        if let Some(secs) = non_empty_env(TIMEOUT_ENV).and_then(|s| s.parse::<u64>().ok()) {
            creds.timeout = Duration::from_secs(secs);
        }
        creds
    }

    pub fn with_key(mut self, kind: ProviderKind, key: impl Into<String>) -> Self {
        self.api_keys.insert(kind, key.into());
        self
    }

    pub fn with_base_url(mut self, kind: ProviderKind, url: impl Into<String>) -> Self {
        self.base_urls.insert(kind, url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_key(&self, kind: ProviderKind) -> bool {
        self.api_keys.contains_key(&kind)
    }

    fn client_params(&self, kind: ProviderKind) -> Option<ClientParams> {
        let api_key = self.api_keys.get(&kind)?.clone();
        let base_url = self
            .base_urls
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| kind.default_base_url().to_string());
        Some(ClientParams {
            api_key,
            base_url,
            timeout: self.timeout,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn toggle_disables(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

// =============================================================================
// Registry
// =============================================================================

/// Which models a run should evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSelection {
    All,
    Single(String),
    Batch(Vec<String>),
}

impl ModelSelection {
    /// Batch models win over a single selection, which wins over "all".
    pub fn resolve(batch: Option<&BatchConfig>, single: Option<&str>) -> Self {
        if let Some(batch) = batch.filter(|b| !b.models.is_empty()) {
            if single.is_some() {
                tracing::warn!("batch model list overrides the single-model selection");
            }
            return ModelSelection::Batch(batch.models.clone());
        }
        match single {
            Some(entry) => ModelSelection::Single(entry.to_string()),
            None => ModelSelection::All,
        }
    }
}

/// A requested model that did not make it into the run.
#[derive(Debug)]
pub struct SkippedModel {
    pub entry: String,
    pub reason: RegistryError,
}

/// The models a run will evaluate, in evaluation order.
pub struct InitializedModels {
    pub models: Vec<ModelClient>,
    pub versions: BTreeMap<String, String>,
    pub skipped: Vec<SkippedModel>,
}

impl InitializedModels {
    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name.as_str()).collect()
    }
}

pub struct ModelRegistry {
    catalog: ModelCatalog,
    credentials: Credentials,
    toggles: HashMap<String, String>,
}

impl ModelRegistry {
    /// Snapshot per-model toggles from the environment.
    pub fn new(catalog: ModelCatalog, credentials: Credentials) -> Self {
        let toggles = catalog
            .specs()
            .iter()
            .filter_map(|s| non_empty_env(&s.enabled_env).map(|v| (s.enabled_env.clone(), v)))
            .collect();
        Self {
            catalog,
            credentials,
            toggles,
        }
    }

    pub fn with_toggle(mut self, env: impl Into<String>, value: impl Into<String>) -> Self {
        self.toggles.insert(env.into(), value.into());
        self
    }

    fn is_disabled(&self, spec: &ModelSpec) -> bool {
        self.toggles
            .get(&spec.enabled_env)
            .is_some_and(|v| toggle_disables(v))
    }

    /// `provider:model_id` for every model with a credential and not disabled.
    pub fn list_available_models(&self) -> Vec<String> {
        self.catalog
            .specs()
            .iter()
            .filter(|s| self.credentials.has_key(s.provider) && !self.is_disabled(s))
            .map(ModelSpec::key)
            .collect()
    }

    /// Resolve a selection entry to an eligible spec.
    pub fn eligible_spec(&self, entry: &str) -> Result<&ModelSpec, RegistryError> {
        let (provider, model_id) = parse_selection(entry)?;
        let spec = self
            .catalog
            .find(provider, &model_id)
            .ok_or_else(|| RegistryError::UnknownModel(entry.to_string()))?;
        if !self.credentials.has_key(provider) {
            return Err(RegistryError::MissingCredential {
                entry: entry.to_string(),
                env: provider.api_key_env(),
            });
        }
        if self.is_disabled(spec) {
            return Err(RegistryError::Disabled {
                entry: entry.to_string(),
                env: spec.enabled_env.clone(),
            });
        }
        Ok(spec)
    }

    /// Build clients for the selection. Individual failures are skipped;
    /// only an empty result is an error.
    pub fn initialize(
        &self,
        selection: &ModelSelection,
        usage_sink: Arc<dyn UsageSink>,
        gateway_config: &GatewayConfig,
        attribution: &Attribution,
    ) -> Result<InitializedModels, RegistryError> {
        let requested: Vec<String> = match selection {
            ModelSelection::All => {
                for spec in self.catalog.specs() {
                    if !self.credentials.has_key(spec.provider) {
                        tracing::warn!(
                            model = %spec.display_name,
                            "{} not found, skipping {}",
                            spec.provider.api_key_env(),
                            spec.key()
                        );
                    }
                }
                self.list_available_models()
            }
            ModelSelection::Single(entry) => vec![entry.clone()],
            ModelSelection::Batch(entries) => entries.clone(),
        };

        let mut models = Vec::new();
        let mut versions = BTreeMap::new();
        let mut skipped = Vec::new();
        let mut names: HashSet<String> = HashSet::new();

        for entry in requested {
            let result = self
                .eligible_spec(&entry)
                .and_then(|spec| {
                    if names.contains(&spec.display_name) {
                        return Err(RegistryError::Duplicate {
                            entry: entry.clone(),
                            name: spec.display_name.clone(),
                        });
                    }
                    Ok(spec)
                })
                .and_then(|spec| {
                    self.build_client(spec, usage_sink.clone(), gateway_config, attribution)
                        .map_err(|source| RegistryError::Client {
                            entry: entry.clone(),
                            source,
                        })
                });

            match result {
                Ok(client) => {
                    tracing::info!(
                        model = %client.name,
                        version = %client.version,
                        "initialized {entry}"
                    );
                    names.insert(client.name.clone());
                    versions.insert(client.name.clone(), client.version.clone());
                    models.push(client);
                }
                Err(reason) => {
                    tracing::warn!(%entry, "skipping model: {reason}");
                    skipped.push(SkippedModel { entry, reason });
                }
            }
        }

        if models.is_empty() {
            return Err(RegistryError::NoModels);
        }

        Ok(InitializedModels {
            models,
            versions,
            skipped,
        })
    }

    fn build_client(
        &self,
        spec: &ModelSpec,
        usage_sink: Arc<dyn UsageSink>,
        gateway_config: &GatewayConfig,
        attribution: &Attribution,
    ) -> Result<ModelClient, ProviderError> {
        let params = self.credentials.client_params(spec.provider).ok_or_else(|| {
            ProviderError::config(format!("{} not set", spec.provider.api_key_env()))
        })?;
        let adapter = spec.provider.build_adapter(&params)?;
        let gateway = ProviderGateway::with_config(adapter, usage_sink, gateway_config.clone());
        let client = ScoringClient::new(Arc::new(gateway), spec.model.clone(), spec.coercion)
            .temperature(spec.temperature)
            .with_attribution(attribution.clone());
        Ok(ModelClient::new(
            spec.display_name.clone(),
            spec.version.clone(),
            Arc::new(client),
        ))
    }
}
