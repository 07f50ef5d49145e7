//! Offline provider that streams the last user message back.
//!
//! Useful for exercising the gateway end to end without credentials.

use async_trait::async_trait;
use std::time::Duration;

use super::models::{ModelSpec, ModelTable};
use super::types::{
    ChatRole, ChunkSink, CompletionRequest, LlmProvider, ProviderOutput, StopReason, TokenUsage,
};
use crate::error::ProviderResult;

pub const DEFAULT_MODEL: &str = "echo-1";

pub static ECHO_MODELS: ModelTable = ModelTable::new(
    &[(DEFAULT_MODEL, ModelSpec::new(32_768, 32_768))],
    ModelSpec::new(32_768, 32_768),
);

/// Echo provider
#[derive(Debug, Default)]
pub struct EchoProvider {
    chunk_delay: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between streamed words.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn reply(request: &CompletionRequest) -> &str {
        request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Split into words, each keeping its trailing whitespace.
fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(char::is_whitespace)
}

#[async_trait]
impl LlmProvider for EchoProvider {
    fn provider_name(&self) -> &str {
        "echo"
    }

    fn models(&self) -> &ModelTable {
        &ECHO_MODELS
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    async fn send_completion(&self, request: &CompletionRequest) -> ProviderResult<ProviderOutput> {
        let text = Self::reply(request).to_string();
        Ok(ProviderOutput {
            usage: TokenUsage::estimate(request, &text),
            text,
            tool_call: None,
            stop_reason: StopReason::EndTurn,
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        on_chunk: ChunkSink<'_>,
    ) -> ProviderResult<ProviderOutput> {
        let mut text = String::new();
        for word in words(Self::reply(request)) {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            on_chunk(word);
            text.push_str(word);
        }
        Ok(ProviderOutput {
            usage: TokenUsage::estimate(request, &text),
            text,
            tool_call: None,
            stop_reason: StopReason::EndTurn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::ChatMessage;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            provider: "echo".into(),
            model: String::new(),
            messages: vec![
                ChatMessage::user("first"),
                ChatMessage::new(ChatRole::Assistant, "ignored"),
                ChatMessage::user(text),
            ],
            temperature: None,
            tools: Vec::new(),
            streaming: true,
        }
    }

    #[tokio::test]
    async fn test_send_echoes_last_user_message() {
        let output = EchoProvider::new()
            .send_completion(&request("Hello, world!"))
            .await
            .unwrap();
        assert_eq!(output.text, "Hello, world!");
        assert!(output.usage.estimated);
        assert_eq!(output.usage.output_tokens, 4);
    }

    #[tokio::test]
    async fn test_stream_chunks_concatenate_to_text() {
        let mut chunks = Vec::new();
        let mut sink = |c: &str| chunks.push(c.to_string());
        let output = EchoProvider::new()
            .stream_completion(&request("one  two\nthree"), &mut sink)
            .await
            .unwrap();
        assert_eq!(chunks, vec!["one ", " ", "two\n", "three"]);
        assert_eq!(chunks.concat(), output.text);
    }

    #[tokio::test]
    async fn test_empty_message_streams_nothing() {
        let mut count = 0;
        let mut sink = |_: &str| count += 1;
        let output = EchoProvider::new()
            .stream_completion(&request(""), &mut sink)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(output.usage.output_tokens, 0);
    }
}
