//! Usage metering
//!
//! Credits are a fixed linear function of tokens, identical for every
//! provider. After a provider call returns, the meter charges the store once:
//! the deduction and its usage row land together or not at all.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{AccountStore, UsageRecord, UserIdentity};

/// Credits charged per thousand tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CreditRate {
    per_1k_tokens: f64,
}

impl CreditRate {
    /// Negative or non-finite rates are clamped to zero.
    pub fn new(per_1k_tokens: f64) -> Self {
        let per_1k_tokens = if per_1k_tokens.is_finite() && per_1k_tokens > 0.0 {
            per_1k_tokens
        } else {
            0.0
        };
        Self { per_1k_tokens }
    }

    pub fn per_1k_tokens(&self) -> f64 {
        self.per_1k_tokens
    }

    pub fn credits_for(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.per_1k_tokens
    }
}

impl Default for CreditRate {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("user '{0}' not found")]
    UnknownUser(String),

    #[error("insufficient credits (balance {balance})")]
    InsufficientCredits { balance: f64 },

    #[error("account store error: {0}")]
    Store(String),
}

/// Outcome of a successful charge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterReceipt {
    pub balance: f64,
}

pub struct UsageMeter {
    store: Arc<dyn AccountStore>,
    rate: CreditRate,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn AccountStore>, rate: CreditRate) -> Self {
        Self { store, rate }
    }

    pub fn store(&self) -> &Arc<dyn AccountStore> {
        &self.store
    }

    pub fn rate(&self) -> CreditRate {
        self.rate
    }

    pub fn credits_for(&self, tokens: u64) -> f64 {
        self.rate.credits_for(tokens)
    }

    /// Refuse to start a request for a user at or below zero credits.
    pub async fn preflight(&self, user_id: &str) -> Result<UserIdentity, MeterError> {
        let user = self
            .store
            .fetch_user(user_id)
            .await
            .map_err(|e| MeterError::Store(e.to_string()))?
            .ok_or_else(|| MeterError::UnknownUser(user_id.to_string()))?;
        if user.credits_remaining <= 0.0 {
            return Err(MeterError::InsufficientCredits {
                balance: user.credits_remaining,
            });
        }
        Ok(user)
    }

    /// Deduct `credits_used` and append the matching usage row atomically.
    pub async fn record_and_deduct(
        &self,
        user_id: &str,
        provider: &str,
        model: &str,
        tokens_used: u64,
        credits_used: f64,
    ) -> Result<MeterReceipt, MeterError> {
        let record = UsageRecord {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            tokens_used,
            credits_used,
            timestamp: Utc::now(),
        };
        let balance = self.store.charge(&record).await.map_err(|e| {
            warn!(
                user_id = user_id,
                tokens = tokens_used,
                "Charge not recorded: {}",
                e
            );
            MeterError::Store(e.to_string())
        })?;

        debug!(
            user_id = user_id,
            provider = provider,
            model = model,
            tokens = tokens_used,
            credits = credits_used,
            balance = balance,
            "Metered request"
        );
        Ok(MeterReceipt { balance })
    }
}
