//! OpenAI Chat Completions adapter

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::http::{build_client, check_status, join_url};
use super::models::{ModelTable, OPENAI_MODELS};
use super::sse::for_each_event;
use super::types::{
    ChunkSink, CompletionRequest, LlmProvider, ProviderOutput, StopReason, TokenUsage, ToolCall,
};
use crate::error::{ProviderError, ProviderResult};
use crate::tokens::estimate_prompt_tokens;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o";
const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI provider
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl OpenAiProvider {
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

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> Value {
        let model = self.model_for(request);
        let spec = self.models().resolve(model);

        // System messages stay in place: the chat format carries them natively
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_completion_tokens": spec.output_budget(estimate_prompt_tokens(&request.messages)),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.json_schema(),
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["parallel_tool_calls"] = Value::Bool(false);
        }
        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn post(&self, body: &Value) -> ProviderResult<reqwest::Response> {
        let response = self
            .client
            .post(join_url(&self.base_url, "/v1/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        check_status(self.provider_name(), response).await
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: FunctionCall,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
}

fn stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("stop") | None => StopReason::EndTurn,
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        Some(_) => StopReason::Unknown,
    }
}

fn parse_arguments(name: &str, arguments: &str) -> ProviderResult<Value> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments).map_err(|e| {
        ProviderError::MalformedResponse(format!(
            "function '{}' arguments are not valid JSON: {}",
            name, e
        ))
    })
}

/// Tool call assembled from indexed stream fragments
#[derive(Debug, Default)]
struct PendingCall {
    index: usize,
    id: Option<String>,
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        "openai"
    }

    fn models(&self) -> &ModelTable {
        &OPENAI_MODELS
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send_completion(&self, request: &CompletionRequest) -> ProviderResult<ProviderOutput> {
        let body = self.build_body(request, false);
        debug!(
            provider = "openai",
            model = %self.model_for(request),
            messages = request.messages.len(),
            "sending completion"
        );
        let response = self.post(&body).await?;
        let parsed: ChatResponse = serde_json::from_str(&response.text().await?)?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::MalformedResponse("response has no choices".into()))?;

        let tool_call = match choice.message.tool_calls.into_iter().next() {
            Some(call) => {
                let parameters = parse_arguments(&call.function.name, &call.function.arguments)?;
                Some(ToolCall::new(call.id, call.function.name, parameters))
            }
            None => None,
        };
        let text = choice.message.content.unwrap_or_default();
        let counts = parsed.usage.map(|u| (u.prompt_tokens, u.completion_tokens));

        Ok(ProviderOutput {
            usage: TokenUsage::reported_or_estimated(counts, request, &text),
            stop_reason: stop_reason(choice.finish_reason.as_deref()),
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
            provider = "openai",
            model = %self.model_for(request),
            "sending streaming completion"
        );
        let response = self.post(&body).await?;

        let mut text = String::new();
        let mut call: Option<PendingCall> = None;
        let mut counts = None;
        let mut finish = None;
        let mut done = false;

        for_each_event(response, |event| {
            if event.data.trim() == DONE_SENTINEL {
                done = true;
                return Ok(false);
            }
            let chunk: StreamChunk = serde_json::from_str(&event.data)?;
            if let Some(err) = chunk.error {
                return Err(ProviderError::Transport(format!("stream error: {}", err.message)));
            }
            if let Some(usage) = chunk.usage {
                counts = Some((usage.prompt_tokens, usage.completion_tokens));
            }
            for choice in chunk.choices {
                if let Some(part) = choice.delta.content.filter(|p| !p.is_empty()) {
                    on_chunk(&part);
                    text.push_str(&part);
                }
                for delta in choice.delta.tool_calls {
                    let pending = call.get_or_insert_with(|| PendingCall {
                        index: delta.index,
                        ..Default::default()
                    });
                    // Only the first call is surfaced
                    if pending.index != delta.index {
                        continue;
                    }
                    if delta.id.is_some() {
                        pending.id = delta.id;
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            pending.name.push_str(&name);
                        }
                        if let Some(arguments) = function.arguments {
                            pending.arguments.push_str(&arguments);
                        }
                    }
                }
                if choice.finish_reason.is_some() {
                    finish = choice.finish_reason;
                }
            }
            Ok(true)
        })
        .await?;

        if !done && finish.is_none() {
            return Err(ProviderError::Transport(
                "stream ended before completion".into(),
            ));
        }

        let tool_call = match call {
            Some(pending) if !pending.name.is_empty() => {
                let parameters = parse_arguments(&pending.name, &pending.arguments)?;
                Some(ToolCall::new(pending.id, pending.name, parameters))
            }
            _ => None,
        };

        Ok(ProviderOutput {
            usage: TokenUsage::reported_or_estimated(counts, request, &text),
            stop_reason: stop_reason(finish.as_deref()),
            text,
            tool_call,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::{ChatMessage, ChatRole, ToolSpec};

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("sk-test").unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            provider: "openai".into(),
            model: "gpt-4o-mini-2024-07-18".into(),
            messages: vec![
                ChatMessage::new(ChatRole::System, "Be brief."),
                ChatMessage::user("Hello"),
            ],
            temperature: Some(0.2),
            tools: Vec::new(),
            streaming: true,
        }
    }

    #[test]
    fn test_body_keeps_system_message_inline() {
        let body = provider().build_body(&request(), false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hello");
        assert_eq!(body["max_completion_tokens"], 16_384);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_gpt4_output_fits_context_window() {
        let mut req = request();
        req.model = "gpt-4-0613".into();
        let body = provider().build_body(&req, false);
        assert_eq!(body["max_completion_tokens"], 4_096);

        // 24k chars ≈ 6000 prompt tokens leaves 2192 of the 8192 window
        req.messages = vec![ChatMessage::user("x".repeat(24_000))];
        let body = provider().build_body(&req, false);
        assert_eq!(body["max_completion_tokens"], 2_192);
    }

    #[test]
    fn test_stream_body_requests_usage() {
        let body = provider().build_body(&request(), true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_tools_wrapped_as_functions() {
        let mut req = request();
        req.tools = vec![ToolSpec {
            name: "get_weather".into(),
            description: "Weather".into(),
            parameter_schema: Default::default(),
        }];
        let body = provider().build_body(&req, false);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["parallel_tool_calls"], false);
    }

    #[test]
    fn test_empty_model_uses_default() {
        let mut req = request();
        req.model.clear();
        let body = provider().with_default_model("gpt-4.1").build_body(&req, false);
        assert_eq!(body["model"], "gpt-4.1");
        assert_eq!(body["max_completion_tokens"], 32_768);
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("f", "").unwrap(), json!({}));
        assert_eq!(parse_arguments("f", r#"{"a":1}"#).unwrap()["a"], 1);
        assert!(parse_arguments("f", "{oops").is_err());
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(stop_reason(Some("tool_calls")), StopReason::ToolUse);
        assert_eq!(stop_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(stop_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(stop_reason(Some("content_filter")), StopReason::Unknown);
    }
}
