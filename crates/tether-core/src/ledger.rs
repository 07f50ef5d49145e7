//! Account store contract
//!
//! The gateway never owns user balances. It reads a [`UserIdentity`] snapshot,
//! deducts credits and appends [`UsageRecord`]s through [`AccountStore`];
//! `tether-ledger` provides the SQLite implementation and [`MemoryLedger`]
//! serves tests and ephemeral deployments.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Read-only projection of an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub credits_remaining: f64,
    #[serde(default = "default_tier")]
    pub subscription_tier: String,
}

fn default_tier() -> String {
    "free".to_string()
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, credits: f64) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            credits_remaining: credits,
            subscription_tier: default_tier(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.subscription_tier = tier.into();
        self
    }
}

/// One metered request, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: String,
    pub provider: String,
    pub model: String,
    pub tokens_used: u64,
    pub credits_used: f64,
    pub timestamp: DateTime<Utc>,
}

/// Persistent account/credit store
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Fetch a user, `None` when unknown.
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserIdentity>>;

    /// Subtract `record.credits_used` from the user's balance and append
    /// `record` as one unit: on error neither change is kept. Returns the
    /// new balance, which may go negative.
    async fn charge(&self, record: &UsageRecord) -> Result<f64>;

    /// Most recent usage rows for a user, newest first.
    async fn recent_usage(&self, user_id: &str, limit: usize) -> Result<Vec<UsageRecord>>;
}

/// In-process account store
#[derive(Debug, Default)]
pub struct MemoryLedger {
    users: RwLock<HashMap<String, UserIdentity>>,
    usage: RwLock<Vec<UsageRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user.
    pub async fn upsert_user(&self, user: UserIdentity) {
        debug!("Upserting user {}", user.user_id);
        self.users.write().await.insert(user.user_id.clone(), user);
    }

    /// Every usage row in insertion order.
    pub async fn usage_log(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }
}

#[async_trait]
impl AccountStore for MemoryLedger {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserIdentity>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn charge(&self, record: &UsageRecord) -> Result<f64> {
        // both changes land under the users lock
        let mut users = self.users.write().await;
        let user = users
            .get_mut(&record.user_id)
            .ok_or_else(|| anyhow!("user '{}' not found", record.user_id))?;
        self.usage.write().await.push(record.clone());
        user.credits_remaining -= record.credits_used;
        Ok(user.credits_remaining)
    }

    async fn recent_usage(&self, user_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        Ok(self
            .usage
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
