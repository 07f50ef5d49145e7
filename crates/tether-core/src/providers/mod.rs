//! Multi-provider LLM abstraction layer
//!
//! Every backend implements [`LlmProvider`]; the [`ProviderRouter`] maps a
//! request's provider name (or alias) onto the adapter that serves it.
//! Backend payloads are translated to and from the normalized types in
//! [`types`] inside each adapter and nowhere else.

pub mod anthropic;
pub mod echo;
pub mod google;
pub mod http;
pub mod models;
pub mod openai;
pub mod router;
pub mod sse;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use echo::EchoProvider;
pub use google::GoogleProvider;
pub use models::{ModelMatch, ModelSpec, ModelTable};
pub use openai::OpenAiProvider;
pub use router::{ProviderRouter, canonical_name};
pub use types::{
    ChatMessage, ChatRole, ChunkSink, CompletionRequest, CompletionResult, LlmProvider,
    ParameterDecl, ProviderOutput, StopReason, TokenUsage, ToolCall, ToolSpec,
};
