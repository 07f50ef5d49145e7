//! Auth bridge: single-use handshake tokens
//!
//! The login flow mints a token for a user; the token is then delivered to
//! a waiting connection (over `POST /auth`, or typed in by the user as a
//! fallback). A token is MINTED until it is either CONSUMED by one delivery
//! or EXPIRED. Expired tokens are swept by bucketed expiry, so a sweep only
//! touches tokens that are actually due.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use tether_core::redact::token_prefix;
use tether_core::{AccountStore, UserIdentity};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::MintedToken;
use crate::registry::{ConnectionRegistry, ConnectionState};

const TOKEN_BYTES: usize = 32;

struct TokenRecord {
    user_id: String,
    expires: Instant,
    consumed: bool,
}

pub struct AuthBridge {
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn AccountStore>,
    ttl: Duration,
    control_token: Option<String>,
    tokens: DashMap<String, TokenRecord>,
    /// Whole seconds after `epoch` (rounded up) → tokens expiring by then
    expiry_index: Mutex<BTreeMap<u64, Vec<String>>>,
    epoch: Instant,
}

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

fn generate_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl AuthBridge {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn AccountStore>,
        ttl: Duration,
        control_token: Option<String>,
    ) -> Self {
        Self {
            registry,
            store,
            ttl,
            control_token: control_token.filter(|t| !t.is_empty()),
            tokens: DashMap::new(),
            expiry_index: Mutex::new(BTreeMap::new()),
            epoch: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn index(&self) -> MutexGuard<'_, BTreeMap<u64, Vec<String>>> {
        self.expiry_index.lock().unwrap_or_else(|poisoned| {
            warn!("Token index mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Check the `Authorization` header of a control-plane call.
    pub fn verify_control_token(&self, header: Option<&str>) -> GatewayResult<()> {
        let Some(expected) = &self.control_token else {
            return Ok(());
        };
        let presented = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .unwrap_or_default();
        if safe_equal(presented, expected) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized(
                "missing or invalid control token".into(),
            ))
        }
    }

    pub fn mint(&self, user_id: &str) -> GatewayResult<MintedToken> {
        self.mint_at(user_id, Instant::now())
    }

    /// Mint a token for `user_id` valid for the configured lifetime.
    pub fn mint_at(&self, user_id: &str, now: Instant) -> GatewayResult<MintedToken> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(GatewayError::InvalidRequest("userId is required".into()));
        }

        let token = generate_token();
        let expires = now + self.ttl;
        let bucket = expires
            .saturating_duration_since(self.epoch)
            .as_secs_f64()
            .ceil() as u64;

        self.tokens.insert(
            token.clone(),
            TokenRecord {
                user_id: user_id.to_string(),
                expires,
                consumed: false,
            },
        );
        self.index().entry(bucket).or_default().push(token.clone());

        let issued_at: DateTime<Utc> = Utc::now();
        let expires_at = issued_at
            + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(300));
        info!(
            "Minted token {} for user '{}'",
            token_prefix(&token),
            user_id
        );
        Ok(MintedToken {
            token,
            user_id: user_id.to_string(),
            issued_at,
            expires_at,
        })
    }

    pub async fn deliver_token(
        &self,
        connection_id: &str,
        token: &str,
        user: Option<UserIdentity>,
    ) -> GatewayResult<UserIdentity> {
        self.deliver_token_at(connection_id, token, user, Instant::now())
            .await
    }

    /// Deliver `token` to `connection_id`, authenticating it and pushing the
    /// `authenticated` frame. Without a `user` snapshot the token owner is
    /// looked up in the account store.
    ///
    /// A failed delivery for a missing or closed connection leaves the token
    /// unconsumed.
    pub async fn deliver_token_at(
        &self,
        connection_id: &str,
        token: &str,
        user: Option<UserIdentity>,
        now: Instant,
    ) -> GatewayResult<UserIdentity> {
        let connection_id = connection_id.trim();
        let owner = {
            let record = self.tokens.get(token).ok_or(GatewayError::TokenInvalid)?;
            if record.consumed || record.expires <= now {
                debug!("Rejected spent token {}", token_prefix(token));
                return Err(GatewayError::TokenInvalid);
            }
            record.user_id.clone()
        };

        let user = match user {
            Some(user) if user.user_id == owner => user,
            Some(user) => {
                warn!(
                    "Token {} belongs to '{}', not '{}'",
                    token_prefix(token),
                    owner,
                    user.user_id
                );
                return Err(GatewayError::TokenInvalid);
            }
            None => self
                .store
                .fetch_user(&owner)
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?
                .ok_or_else(|| {
                    GatewayError::Unauthorized(format!("user '{}' has no account", owner))
                })?,
        };

        // Re-check under the token's lock: a concurrent delivery may have won
        let mut record = self.tokens.get_mut(token).ok_or(GatewayError::TokenInvalid)?;
        if record.consumed || record.expires <= now {
            return Err(GatewayError::TokenInvalid);
        }
        match self.registry.state(connection_id) {
            None | Some(ConnectionState::Closed) => {
                return Err(GatewayError::ConnectionNotFound(connection_id.to_string()));
            }
            Some(ConnectionState::Authenticated) => {
                return Err(GatewayError::AlreadyAuthenticated(
                    connection_id.to_string(),
                ));
            }
            Some(ConnectionState::Pending) => {}
        }

        record.consumed = true;
        if let Err(e) = self.registry.try_authenticate(connection_id, &user) {
            record.consumed = false;
            return Err(e);
        }
        info!(
            "Delivered token {} to connection '{}'",
            token_prefix(token),
            connection_id
        );
        Ok(user)
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Drop every token whose expiry has passed, consumed or not.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let now_secs = now.saturating_duration_since(self.epoch).as_secs();
        let due = {
            let mut index = self.index();
            let later = index.split_off(&(now_secs + 1));
            std::mem::replace(&mut *index, later)
        };

        let mut removed = 0;
        for token in due.into_values().flatten() {
            if self
                .tokens
                .remove_if(&token, |_, record| record.expires <= now)
                .is_some()
            {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Swept {} expired tokens", removed);
        }
        removed
    }

    /// Tokens currently held, consumed ones included.
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}
