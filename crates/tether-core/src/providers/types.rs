//! Provider-agnostic types for multi-backend completion

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use super::models::ModelTable;
use crate::error::ProviderResult;
use crate::tokens::{estimate_prompt_tokens, estimate_token_count};

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One entry of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }
}

/// A tool parameter as declared by the client.
///
/// Clients may send either a bare description string or an object; a
/// parameter without an explicit `type` is treated as a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterDecl {
    Description(String),
    Spec {
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        required: Option<bool>,
        #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
        choices: Option<Vec<Value>>,
    },
}

impl ParameterDecl {
    fn kind(&self) -> &str {
        match self {
            Self::Spec {
                kind: Some(kind), ..
            } => kind,
            _ => "string",
        }
    }

    fn description(&self) -> Option<&str> {
        match self {
            Self::Description(text) => Some(text),
            Self::Spec { description, .. } => description.as_deref(),
        }
    }

    fn is_required(&self) -> bool {
        match self {
            Self::Description(_) => true,
            Self::Spec { required, .. } => required.unwrap_or(true),
        }
    }
}

/// A caller-defined tool the model may invoke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameter_schema: BTreeMap<String, ParameterDecl>,
}

impl ToolSpec {
    /// JSON-Schema object describing the tool's parameters.
    ///
    /// Every backend accepts this shape; adapters only differ in where they
    /// put it.
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, decl) in &self.parameter_schema {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(decl.kind().to_string()));
            if let Some(desc) = decl.description() {
                prop.insert("description".into(), Value::String(desc.to_string()));
            }
            if let ParameterDecl::Spec {
                choices: Some(choices),
                ..
            } = decl
            {
                prop.insert("enum".into(), Value::Array(choices.clone()));
            }
            properties.insert(name.clone(), Value::Object(prop));
            if decl.is_required() {
                required.push(Value::String(name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// A normalized completion request, independent of backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub provider: String,
    #[serde(default)]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub streaming: bool,
}

impl CompletionRequest {
    /// Check the request is something any backend could accept.
    pub fn validate(&self) -> Result<(), String> {
        if self.provider.trim().is_empty() {
            return Err("provider is required".into());
        }
        if self.messages.is_empty() {
            return Err("messages must not be empty".into());
        }
        if !self.messages.iter().any(|m| m.role != ChatRole::System) {
            return Err("at least one user or assistant message is required".into());
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(format!("temperature {} is outside 0.0..=2.0", t));
        }
        if let Some(tool) = self.tools.iter().find(|t| t.name.trim().is_empty()) {
            return Err(format!("tool with description '{}' has no name", tool.description));
        }
        Ok(())
    }

    /// System messages joined in order, if there are any.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// Non-system messages in conversation order.
    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != ChatRole::System)
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: Value,
}

impl ToolCall {
    /// Build a tool call, minting an id when the backend did not supply one.
    pub fn new(id: Option<String>, name: impl Into<String>, parameters: Value) -> Self {
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
        Self {
            id,
            name: name.into(),
            parameters,
        }
    }
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown,
}

impl StopReason {
    /// The backend cut the output at its token limit.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::MaxTokens)
    }
}

/// Token usage for one provider call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// True when the counts came from the fallback estimator
    pub estimated: bool,
}

impl TokenUsage {
    pub fn exact(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            estimated: false,
        }
    }

    /// Character-based estimate for a request and the text produced for it.
    pub fn estimate(request: &CompletionRequest, output: &str) -> Self {
        Self {
            input_tokens: estimate_prompt_tokens(&request.messages),
            output_tokens: estimate_token_count(output),
            estimated: true,
        }
    }

    /// Prefer backend-reported counts; estimate only when none were given.
    pub fn reported_or_estimated(
        reported: Option<(u64, u64)>,
        request: &CompletionRequest,
        output: &str,
    ) -> Self {
        match reported {
            Some((input, output_tokens)) => Self::exact(input, output_tokens),
            None => Self::estimate(request, output),
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// What an adapter hands back once a call has finished
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub text: String,
    pub usage: TokenUsage,
    pub tool_call: Option<ToolCall>,
    pub stop_reason: StopReason,
}

/// The metered result returned to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub text: String,
    pub tokens_used: u64,
    pub credits_used: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    /// Output stopped at the model's token limit
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

/// Receives streamed text fragments in backend order.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Trait that all LLM backends implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name (e.g. "anthropic", "openai")
    fn provider_name(&self) -> &str;

    /// Static model capability table for this backend
    fn models(&self) -> &ModelTable;

    /// Model used when the request leaves `model` empty
    fn default_model(&self) -> &str;

    /// Run a completion and return the whole answer at once.
    async fn send_completion(&self, request: &CompletionRequest) -> ProviderResult<ProviderOutput>;

    /// Run a completion, pushing text fragments into `on_chunk` as they
    /// arrive. The returned text equals the concatenation of every fragment.
    ///
    /// Backends without native streaming emit the whole answer as one chunk.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkSink<'_>,
    ) -> ProviderResult<ProviderOutput> {
        let output = self.send_completion(request).await?;
        if !output.text.is_empty() {
            on_chunk(&output.text);
        }
        Ok(output)
    }
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}
