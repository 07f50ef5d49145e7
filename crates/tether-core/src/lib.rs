//! tether-core — provider adapters, usage metering and shared domain types
//!
//! The gateway crate owns sockets and connection state; everything that talks
//! to an LLM backend or to the account store lives here.

pub mod config;
pub mod error;
pub mod ledger;
pub mod meter;
pub mod providers;
pub mod redact;
pub mod tokens;

pub use config::TetherConfig;
pub use error::{ProviderError, ProviderResult};
pub use ledger::{AccountStore, MemoryLedger, UsageRecord, UserIdentity};
pub use meter::{CreditRate, MeterError, MeterReceipt, UsageMeter};
pub use providers::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResult, LlmProvider, ProviderOutput,
    ProviderRouter, TokenUsage, ToolCall, ToolSpec,
};
pub use tokens::estimate_token_count;
