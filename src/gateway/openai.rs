//! OpenAI-compatible adapter for `/chat/completions` (OpenAI, xAI).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{
    build_http_client, check_input_size, extract_request_id, is_refusal, read_body_limited,
    ChatProvider, MAX_RESPONSE_LEN,
};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const XAI_BASE_URL: &str = "https://api.x.ai/v1";

/// Adapter for any provider exposing the OpenAI chat completions wire format.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    provider: &'static str,
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiCompatAdapter {
    /// Create with custom configuration.
    pub fn with_config(
        provider: &'static str,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = build_http_client(headers, timeout)?;

        Ok(Self {
            provider,
            client,
            base_url,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ApiToolChoice<'a>>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct ApiTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ApiFunction<'a>,
}

#[derive(Serialize)]
struct ApiFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Serialize)]
struct ApiToolChoice<'a> {
    #[serde(rename = "type")]
    choice_type: &'static str,
    function: ApiToolChoiceFunction<'a>,
}

#[derive(Serialize)]
struct ApiToolChoiceFunction<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

impl ApiError {
    fn code_string(&self) -> Option<String> {
        match &self.code {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => self.error_type.clone(),
        }
    }
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for OpenAiCompatAdapter {
    fn name(&self) -> &'static str {
        self.provider
    }

    fn endpoint(&self) -> &'static str {
        "chat/completions"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_input_size(req)?;

        let start = Instant::now();

        let messages: Vec<ApiMessage> = req.messages.iter().map(ApiMessage::from).collect();

        let (tools, tool_choice) = match &req.forced_tool {
            Some(tool) => (
                Some(vec![ApiTool {
                    tool_type: "function",
                    function: ApiFunction {
                        name: tool.name,
                        description: tool.description,
                        parameters: &tool.parameters,
                    },
                }]),
                Some(ApiToolChoice {
                    choice_type: "function",
                    function: ApiToolChoiceFunction { name: tool.name },
                }),
            ),
            None => (None, None),
        };

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: &messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            // JSON mode and forced tool calls are mutually exclusive on the wire.
            response_format: if req.json_mode && req.forced_tool.is_none() {
                Some(ResponseFormat {
                    format_type: "json_object",
                })
            } else {
                None
            },
            tools,
            tool_choice,
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = extract_request_id(response.headers());
        let body = read_body_limited(self.provider, response).await?;

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = if let Some(id) = &request_id {
            ctx.with_request_id(id)
        } else {
            ctx
        };

        if !status.is_success() {
            if let Ok(parsed) = serde_json::from_str::<ChatApiResponse>(&body) {
                if let Some(error) = parsed.error {
                    let ctx = match error.code_string() {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    };
                    let message = error.message.unwrap_or_default();
                    return Err(ProviderError::from_status(
                        self.provider,
                        status.as_u16(),
                        message,
                        ctx,
                    ));
                }
            }

            return Err(ProviderError::from_status(
                self.provider,
                status.as_u16(),
                format!("HTTP {}", status.as_u16()),
                ctx,
            ));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider(self.provider, format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            if is_refusal(&message) {
                return Err(ProviderError::refused(message));
            }
            return Err(ProviderError::provider(self.provider, message, false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider(self.provider, "No choices in response", false)
            })?;

        let (mut content, refusal, tool_arguments) = match choice.message {
            Some(m) => {
                let args = m
                    .tool_calls
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|tc| tc.function.and_then(|f| f.arguments))
                    .find(|s| !s.trim().is_empty());
                (m.content.unwrap_or_default(), m.refusal, args)
            }
            None => (String::new(), None, None),
        };

        if let Some(refusal) = refusal.filter(|r| !r.trim().is_empty()) {
            return Err(ProviderError::refused(refusal));
        }

        if content.len() > MAX_RESPONSE_LEN {
            content.truncate(MAX_RESPONSE_LEN);
        }

        if tool_arguments.is_none() && is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        // Some compatible endpoints omit usage; count it as zero tokens.
        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            tool_arguments,
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}
