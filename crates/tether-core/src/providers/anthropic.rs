//! Anthropic Messages API adapter

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::http::{build_client, check_status, join_url};
use super::models::{ANTHROPIC_MODELS, ModelTable};
use super::sse::for_each_event;
use super::types::{
    ChunkSink, CompletionRequest, LlmProvider, ProviderOutput, StopReason, TokenUsage, ToolCall,
};
use crate::error::{ProviderError, ProviderResult};
use crate::tokens::estimate_prompt_tokens;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";
const API_VERSION: &str = "2023-06-01";

/// Anthropic provider
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> ProviderResult<Self> {
        Ok(Self {
            client: build_client()?,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn model_for<'a>(&'a self, request: &'a CompletionRequest) -> &'a str {
        if request.model.trim().is_empty() {
            &self.default_model
        } else {
            &request.model
        }
    }

    /// Translate a normalized request into a Messages API body.
    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let model = self.model_for(request);
        let spec = self.models().resolve(model);

        let messages: Vec<Value> = request
            .conversation()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": model,
            "max_tokens": spec.output_budget(estimate_prompt_tokens(&request.messages)),
            "messages": messages,
        });
        if let Some(system) = request.system_prompt() {
            body["system"] = Value::String(system);
        }
        if let Some(t) = request.temperature {
            // Anthropic caps temperature at 1.0
            body["temperature"] = json!(t.min(1.0));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.json_schema(),
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    async fn post(&self, body: &Value) -> ProviderResult<reqwest::Response> {
        let response = self
            .client
            .post(join_url(&self.base_url, "/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;
        check_status(self.provider_name(), response).await
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl ApiError {
    fn into_provider_error(self) -> ProviderError {
        match self.kind.as_str() {
            "rate_limit_error" => ProviderError::RateLimited {
                retry_after_ms: 1_000,
            },
            "overloaded_error" | "api_error" => {
                ProviderError::Transport(format!("{}: {}", self.kind, self.message))
            }
            _ => ProviderError::MalformedResponse(format!("{}: {}", self.kind, self.message)),
        }
    }
}

fn stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("end_turn") | Some("stop_sequence") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(_) => StopReason::Unknown,
    }
}

fn reported(usage: Option<&Usage>) -> Option<(u64, u64)> {
    let usage = usage?;
    Some((usage.input_tokens?, usage.output_tokens?))
}

/// Accumulates one streamed tool_use block
#[derive(Debug, Default)]
struct PendingTool {
    index: usize,
    id: String,
    name: String,
    json: String,
}

impl PendingTool {
    fn finish(self) -> ProviderResult<ToolCall> {
        let parameters = if self.json.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&self.json).map_err(|e| {
                ProviderError::MalformedResponse(format!(
                    "tool '{}' input is not valid JSON: {}",
                    self.name, e
                ))
            })?
        };
        Ok(ToolCall::new(Some(self.id), self.name, parameters))
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> &ModelTable {
        &ANTHROPIC_MODELS
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send_completion(&self, request: &CompletionRequest) -> ProviderResult<ProviderOutput> {
        let body = self.build_body(request, false);
        debug!(
            provider = "anthropic",
            model = %self.model_for(request),
            messages = request.messages.len(),
            "sending completion"
        );
        let response = self.post(&body).await?;
        let parsed: MessagesResponse = serde_json::from_str(&response.text().await?)?;

        let mut text = String::new();
        let mut tool_call = None;
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: part } => text.push_str(&part),
                ContentBlock::ToolUse { id, name, input } if tool_call.is_none() => {
                    tool_call = Some(ToolCall::new(Some(id), name, input));
                }
                _ => {}
            }
        }

        Ok(ProviderOutput {
            usage: TokenUsage::reported_or_estimated(reported(parsed.usage.as_ref()), request, &text),
            stop_reason: stop_reason(parsed.stop_reason.as_deref()),
            text,
            tool_call,
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkSink<'_>,
    ) -> ProviderResult<ProviderOutput> {
        let body = self.build_body(request, true);
        debug!(
            provider = "anthropic",
            model = %self.model_for(request),
            "sending streaming completion"
        );
        let response = self.post(&body).await?;

        let mut text = String::new();
        let mut tool: Option<PendingTool> = None;
        let mut input_tokens = None;
        let mut output_tokens = None;
        let mut stop = None;
        let mut finished = false;

        for_each_event(response, |event| {
            let parsed: StreamEvent = serde_json::from_str(&event.data)?;
            match parsed {
                StreamEvent::MessageStart { message } => {
                    if let Some(usage) = message.usage {
                        input_tokens = usage.input_tokens.or(input_tokens);
                        output_tokens = usage.output_tokens.or(output_tokens);
                    }
                }
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse { id, name, .. },
                } if tool.is_none() => {
                    tool = Some(PendingTool {
                        index,
                        id,
                        name,
                        json: String::new(),
                    });
                }
                StreamEvent::ContentBlockDelta { index, delta } => match delta {
                    BlockDelta::TextDelta { text: part } if !part.is_empty() => {
                        on_chunk(&part);
                        text.push_str(&part);
                    }
                    BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(pending) = tool.as_mut().filter(|t| t.index == index) {
                            pending.json.push_str(&partial_json);
                        }
                    }
                    _ => {}
                },
                StreamEvent::MessageDelta { delta, usage } => {
                    stop = delta.stop_reason.or(stop.take());
                    if let Some(usage) = usage {
                        input_tokens = usage.input_tokens.or(input_tokens);
                        output_tokens = usage.output_tokens.or(output_tokens);
                    }
                }
                StreamEvent::MessageStop => {
                    finished = true;
                    return Ok(false);
                }
                StreamEvent::Error { error } => return Err(error.into_provider_error()),
                _ => {}
            }
            Ok(true)
        })
        .await?;

        if !finished {
            return Err(ProviderError::Transport(
                "stream ended before message_stop".into(),
            ));
        }

        let tool_call = tool.map(PendingTool::finish).transpose()?;
        let counts = input_tokens.zip(output_tokens);
        Ok(ProviderOutput {
            usage: TokenUsage::reported_or_estimated(counts, request, &text),
            stop_reason: stop_reason(stop.as_deref()),
            text,
            tool_call,
        })
    }
}
