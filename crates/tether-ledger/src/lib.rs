//! SQLite account store
//!
//! Two tables: `users` keyed by user id, and an append-only `usage` table
//! indexed by `(user_id, timestamp)`. All access goes through one connection
//! guarded by a mutex and runs on the blocking pool.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use tether_core::{AccountStore, UsageRecord, UserIdentity};

/// SQLite-backed [`AccountStore`] (thread-safe via Arc<Mutex>)
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (creating if needed) the ledger at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite ledger")?;
        info!("Initializing ledger at {:?}", path);
        Self::init(conn)
    }

    /// Ledger that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 user_id TEXT PRIMARY KEY,
                 email TEXT NOT NULL DEFAULT '',
                 credits_remaining REAL NOT NULL DEFAULT 0,
                 subscription_tier TEXT NOT NULL DEFAULT 'free',
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS usage (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 user_id TEXT NOT NULL,
                 provider TEXT NOT NULL,
                 model TEXT NOT NULL,
                 tokens_used INTEGER NOT NULL,
                 credits_used REAL NOT NULL,
                 timestamp TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_usage_user_time ON usage(user_id, timestamp);",
        )
        .context("Failed to initialize ledger schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Ledger mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&conn)
        })
        .await
        .context("spawn_blocking task panicked")?
    }

    /// Insert a user, or update email and tier of an existing one. The
    /// balance of an existing user is left untouched.
    pub async fn upsert_user(&self, user: &UserIdentity) -> Result<()> {
        let user = user.clone();
        self.run(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO users (user_id, email, credits_remaining, subscription_tier, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                     email = excluded.email,
                     subscription_tier = excluded.subscription_tier,
                     updated_at = excluded.updated_at",
                params![
                    &user.user_id,
                    &user.email,
                    user.credits_remaining,
                    &user.subscription_tier,
                    now
                ],
            )?;
            debug!("Upserted user {}", user.user_id);
            Ok(())
        })
        .await
    }

    /// Add credits to a user and return the new balance.
    pub async fn grant_credits(&self, user_id: &str, amount: f64) -> Result<f64> {
        self.adjust(user_id, amount).await
    }

    pub async fn list_users(&self) -> Result<Vec<UserIdentity>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, email, credits_remaining, subscription_tier
                 FROM users ORDER BY user_id",
            )?;
            let users = stmt
                .query_map([], row_to_user)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn adjust(&self, user_id: &str, delta: f64) -> Result<f64> {
        let user_id = user_id.to_owned();
        self.run(move |conn| {
            let balance: Option<f64> = conn
                .query_row(
                    "UPDATE users
                     SET credits_remaining = credits_remaining + ?2, updated_at = ?3
                     WHERE user_id = ?1
                     RETURNING credits_remaining",
                    params![&user_id, delta, Utc::now().to_rfc3339()],
                    |row| row.get(0),
                )
                .optional()?;
            match balance {
                Some(balance) => Ok(balance),
                None => bail!("user '{}' not found", user_id),
            }
        })
        .await
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserIdentity> {
    Ok(UserIdentity {
        user_id: row.get(0)?,
        email: row.get(1)?,
        credits_remaining: row.get(2)?,
        subscription_tier: row.get(3)?,
    })
}

#[async_trait]
impl AccountStore for SqliteLedger {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserIdentity>> {
        let user_id = user_id.to_owned();
        self.run(move |conn| {
            let user = conn
                .query_row(
                    "SELECT user_id, email, credits_remaining, subscription_tier
                     FROM users WHERE user_id = ?1",
                    params![&user_id],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    async fn charge(&self, record: &UsageRecord) -> Result<f64> {
        let record = record.clone();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let balance: Option<f64> = tx
                .query_row(
                    "UPDATE users
                     SET credits_remaining = credits_remaining - ?2, updated_at = ?3
                     WHERE user_id = ?1
                     RETURNING credits_remaining",
                    params![&record.user_id, record.credits_used, Utc::now().to_rfc3339()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(balance) = balance else {
                bail!("user '{}' not found", record.user_id);
            };
            tx.execute(
                "INSERT INTO usage (user_id, provider, model, tokens_used, credits_used, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    &record.user_id,
                    &record.provider,
                    &record.model,
                    record.tokens_used as i64,
                    record.credits_used,
                    // fixed width so timestamps sort lexically
                    record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    async fn recent_usage(&self, user_id: &str, limit: usize) -> Result<Vec<UsageRecord>> {
        let user_id = user_id.to_owned();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, provider, model, tokens_used, credits_used, timestamp
                 FROM usage WHERE user_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![&user_id, limit as i64], |row| {
                    Ok(UsageRecord {
                        user_id: row.get(0)?,
                        provider: row.get(1)?,
                        model: row.get(2)?,
                        tokens_used: row.get::<_, i64>(3)?.max(0) as u64,
                        credits_used: row.get(4)?,
                        timestamp: row
                            .get::<_, String>(5)?
                            .parse::<DateTime<Utc>>()
                            .unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}
