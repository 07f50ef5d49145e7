//! Google Gemini adapter (Generative Language API)

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::http::{build_client, check_status, join_url};
use super::models::{GOOGLE_MODELS, ModelTable};
use super::sse::for_each_event;
use super::types::{
    ChatRole, ChunkSink, CompletionRequest, LlmProvider, ProviderOutput, StopReason, TokenUsage,
    ToolCall,
};
use crate::error::{ProviderError, ProviderResult};
use crate::tokens::estimate_prompt_tokens;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Gemini provider
pub struct GoogleProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl GoogleProvider {
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

    /// The model id becomes a path segment, so only plain id characters
    /// may reach the URL.
    fn endpoint(&self, model: &str, stream: bool) -> ProviderResult<String> {
        let valid = !model.is_empty()
            && model
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(ProviderError::Rejected {
                status: 400,
                message: format!("invalid model id '{}'", model.escape_debug()),
            });
        }
        let path = if stream {
            format!("/v1beta/models/{}:streamGenerateContent?alt=sse", model)
        } else {
            format!("/v1beta/models/{}:generateContent", model)
        };
        Ok(join_url(&self.base_url, &path))
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let spec = self.models().resolve(self.model_for(request));

        let contents: Vec<Value> = request
            .conversation()
            .map(|m| {
                let role = match m.role {
                    ChatRole::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut generation = json!({
            "maxOutputTokens": spec.output_budget(estimate_prompt_tokens(&request.messages))
        });
        if let Some(t) = request.temperature {
            generation["temperature"] = json!(t);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation,
        });
        if let Some(system) = request.system_prompt() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.json_schema(),
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }
        body
    }

    async fn post(&self, request: &CompletionRequest, stream: bool) -> ProviderResult<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint(self.model_for(request), stream)?)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_body(request))
            .send()
            .await?;
        check_status(self.provider_name(), response).await
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl UsageMetadata {
    fn counts(&self) -> Option<(u64, u64)> {
        // candidatesTokenCount is omitted when the model produced nothing
        Some((self.prompt_token_count?, self.candidates_token_count.unwrap_or(0)))
    }
}

/// Running state shared by the JSON and SSE paths
#[derive(Debug, Default)]
struct Accumulator {
    text: String,
    tool_call: Option<ToolCall>,
    counts: Option<(u64, u64)>,
    finish: Option<String>,
}

impl Accumulator {
    /// Fold one response (or stream chunk) in, returning the new text.
    fn absorb(&mut self, response: GenerateResponse) -> ProviderResult<String> {
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::Rejected {
                status: 400,
                message: format!("prompt blocked: {}", reason),
            });
        }
        if let Some(counts) = response.usage_metadata.as_ref().and_then(UsageMetadata::counts) {
            self.counts = Some(counts);
        }
        let mut fresh = String::new();
        for candidate in response.candidates.into_iter().take(1) {
            if candidate.finish_reason.is_some() {
                self.finish = candidate.finish_reason;
            }
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                if let Some(text) = part.text {
                    fresh.push_str(&text);
                }
                if let Some(call) = part.function_call
                    && self.tool_call.is_none()
                {
                    // Gemini never assigns call ids
                    self.tool_call = Some(ToolCall::new(None, call.name, call.args));
                }
            }
        }
        self.text.push_str(&fresh);
        Ok(fresh)
    }

    fn finish(self, request: &CompletionRequest) -> ProviderOutput {
        let stop_reason = if self.tool_call.is_some() {
            StopReason::ToolUse
        } else {
            match self.finish.as_deref() {
                Some("STOP") | None => StopReason::EndTurn,
                Some("MAX_TOKENS") => StopReason::MaxTokens,
                Some(_) => StopReason::Unknown,
            }
        };
        ProviderOutput {
            usage: TokenUsage::reported_or_estimated(self.counts, request, &self.text),
            text: self.text,
            tool_call: self.tool_call,
            stop_reason,
        }
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn provider_name(&self) -> &str {
        "google"
    }

    fn models(&self) -> &ModelTable {
        &GOOGLE_MODELS
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn send_completion(&self, request: &CompletionRequest) -> ProviderResult<ProviderOutput> {
        debug!(
            provider = "google",
            model = %self.model_for(request),
            messages = request.messages.len(),
            "sending completion"
        );
        let response = self.post(request, false).await?;
        let parsed: GenerateResponse = serde_json::from_str(&response.text().await?)?;
        if parsed.candidates.is_empty() && parsed.prompt_feedback.is_none() {
            return Err(ProviderError::MalformedResponse(
                "response has no candidates".into(),
            ));
        }
        let mut acc = Accumulator::default();
        acc.absorb(parsed)?;
        Ok(acc.finish(request))
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkSink<'_>,
    ) -> ProviderResult<ProviderOutput> {
        debug!(
            provider = "google",
            model = %self.model_for(request),
            "sending streaming completion"
        );
        let response = self.post(request, true).await?;

        let mut acc = Accumulator::default();
        for_each_event(response, |event| {
            let chunk: GenerateResponse = serde_json::from_str(&event.data)?;
            let fresh = acc.absorb(chunk)?;
            if !fresh.is_empty() {
                on_chunk(&fresh);
            }
            Ok(true)
        })
        .await?;

        if acc.finish.is_none() {
            return Err(ProviderError::Transport(
                "stream ended before a finishReason".into(),
            ));
        }
        Ok(acc.finish(request))
    }
}
