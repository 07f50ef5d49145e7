//! Connection registry
//!
//! Directory of live sockets keyed by the client-generated connection id.
//! Backed by a sharded `DashMap`, so every state transition happens under a
//! single per-key lock and never under a registry-wide one. Nothing here
//! awaits while holding an entry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tether_core::UserIdentity;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::ServerMessage;

const MAX_CONNECTION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Pending,
    Authenticated,
    Closed,
}

struct ConnectionEntry {
    state: ConnectionState,
    created: Instant,
    created_at: DateTime<Utc>,
    closed: Option<Instant>,
    user_id: Option<String>,
    sender: UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
    generation: u64,
}

impl ConnectionEntry {
    fn close(&mut self, now: Instant) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Closed;
        self.closed = Some(now);
        self.cancel.cancel();
        true
    }
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub connection_id: String,
    pub state: ConnectionState,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Owned by the socket task that registered the connection.
///
/// The generation ties the handle to one registration, so a stale task can
/// never close a connection that has since reused its id.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: String,
    generation: u64,
    sender: UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancelled once the connection is CLOSED.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a frame for the socket writer. Frames for a closed connection
    /// are dropped.
    pub fn send(&self, message: ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sender.send(message).is_ok()
    }
}

pub struct ConnectionRegistry {
    entries: DashMap<String, ConnectionEntry>,
    pending_ttl: Duration,
    closed_retention: Duration,
    next_generation: AtomicU64,
}

/// Trim and check a client-supplied connection id.
pub fn normalize_connection_id(id: &str) -> GatewayResult<String> {
    let id = id.trim();
    if id.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "connectionId cannot be empty".into(),
        ));
    }
    if id.chars().count() > MAX_CONNECTION_ID_LEN {
        return Err(GatewayError::InvalidRequest("connectionId too long".into()));
    }
    if id.chars().any(char::is_control) {
        return Err(GatewayError::InvalidRequest(
            "connectionId contains control characters".into(),
        ));
    }
    Ok(id.to_string())
}

impl ConnectionRegistry {
    /// `pending_ttl` bounds how long a connection may wait for its handshake;
    /// `closed_retention` is how long a CLOSED tombstone stays visible.
    pub fn new(pending_ttl: Duration, closed_retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            pending_ttl,
            closed_retention,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register a new PENDING connection. A live connection under the same
    /// id is refused; a CLOSED tombstone is replaced.
    pub fn register(
        &self,
        connection_id: &str,
        sender: UnboundedSender<ServerMessage>,
    ) -> GatewayResult<ConnectionHandle> {
        let id = normalize_connection_id(connection_id)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let entry = ConnectionEntry {
            state: ConnectionState::Pending,
            created: Instant::now(),
            created_at: Utc::now(),
            closed: None,
            user_id: None,
            sender: sender.clone(),
            cancel: cancel.clone(),
            generation,
        };

        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().state != ConnectionState::Closed {
                    return Err(GatewayError::InvalidRequest(format!(
                        "connection '{}' is already open",
                        id
                    )));
                }
                existing.insert(entry);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }

        info!("Connection '{}' registered", id);
        Ok(ConnectionHandle {
            id,
            generation,
            sender,
            cancel,
        })
    }

    /// PENDING → AUTHENTICATED. False when the id is unknown, CLOSED, or
    /// already authenticated.
    pub fn authenticate(&self, connection_id: &str, user_id: &str) -> bool {
        let Some(mut entry) = self.entries.get_mut(connection_id) else {
            return false;
        };
        if entry.state != ConnectionState::Pending {
            return false;
        }
        entry.state = ConnectionState::Authenticated;
        entry.user_id = Some(user_id.to_string());
        info!("Connection '{}' authenticated as '{}'", connection_id, user_id);
        true
    }

    /// Authenticate and push the `authenticated` frame in one step, so no
    /// other frame can overtake it.
    pub(crate) fn try_authenticate(
        &self,
        connection_id: &str,
        user: &UserIdentity,
    ) -> GatewayResult<()> {
        let Some(mut entry) = self.entries.get_mut(connection_id) else {
            return Err(GatewayError::ConnectionNotFound(connection_id.to_string()));
        };
        match entry.state {
            ConnectionState::Closed => {
                Err(GatewayError::ConnectionNotFound(connection_id.to_string()))
            }
            ConnectionState::Authenticated => Err(GatewayError::AlreadyAuthenticated(
                connection_id.to_string(),
            )),
            ConnectionState::Pending => {
                entry.state = ConnectionState::Authenticated;
                entry.user_id = Some(user.user_id.clone());
                if entry
                    .sender
                    .send(ServerMessage::Authenticated { user: user.clone() })
                    .is_err()
                {
                    debug!(
                        "Connection '{}' writer is gone, authenticated frame dropped",
                        connection_id
                    );
                }
                info!(
                    "Connection '{}' authenticated as '{}'",
                    connection_id, user.user_id
                );
                Ok(())
            }
        }
    }

    pub fn lookup(&self, connection_id: &str) -> Option<ConnectionSnapshot> {
        self.entries.get(connection_id).map(|entry| ConnectionSnapshot {
            connection_id: entry.key().clone(),
            state: entry.state,
            user_id: entry.user_id.clone(),
            created_at: entry.created_at,
        })
    }

    pub fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.entries.get(connection_id).map(|entry| entry.state)
    }

    /// User bound to an AUTHENTICATED connection.
    pub fn authenticated_user(&self, connection_id: &str) -> Option<String> {
        let entry = self.entries.get(connection_id)?;
        if entry.state == ConnectionState::Authenticated {
            entry.user_id.clone()
        } else {
            None
        }
    }

    /// Queue a frame on a live connection.
    pub fn send(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.entries.get(connection_id) {
            Some(entry) if entry.state != ConnectionState::Closed => {
                entry.sender.send(message).is_ok()
            }
            _ => false,
        }
    }

    /// Mark the connection CLOSED and cancel its in-flight work. Idempotent.
    pub fn unregister(&self, connection_id: &str) -> bool {
        let closed = self
            .entries
            .get_mut(connection_id)
            .map(|mut entry| entry.close(Instant::now()))
            .unwrap_or(false);
        if closed {
            info!("Connection '{}' closed", connection_id);
        }
        closed
    }

    /// Close the registration `handle` was issued for, leaving any newer
    /// registration under the same id alone.
    pub fn release(&self, handle: &ConnectionHandle) {
        handle.cancel.cancel();
        let closed = match self.entries.get_mut(&handle.id) {
            Some(mut entry) if entry.generation == handle.generation => {
                entry.close(Instant::now())
            }
            _ => false,
        };
        if closed {
            info!("Connection '{}' closed", handle.id);
        }
    }

    /// Close PENDING connections older than the handshake window and drop
    /// CLOSED tombstones past their retention. Returns (closed, removed).
    pub fn evict_stale_at(&self, now: Instant) -> (usize, usize) {
        let mut closed = 0;
        let mut removed = 0;
        self.entries.retain(|id, entry| match entry.state {
            ConnectionState::Pending
                if now.saturating_duration_since(entry.created) >= self.pending_ttl =>
            {
                let notice = ServerMessage::error(
                    None,
                    &GatewayError::Unauthorized("authentication window elapsed".into()),
                );
                if entry.sender.send(notice).is_err() {
                    debug!("Connection '{}' writer is gone, eviction notice dropped", id);
                }
                entry.close(now);
                debug!("Evicted unauthenticated connection '{}'", id);
                closed += 1;
                true
            }
            ConnectionState::Closed => {
                let expired = entry
                    .closed
                    .is_some_and(|at| now.saturating_duration_since(at) >= self.closed_retention);
                if expired {
                    removed += 1;
                }
                !expired
            }
            _ => true,
        });
        if closed + removed > 0 {
            info!(
                "Registry sweep: {} stale connections closed, {} removed",
                closed, removed
            );
        }
        (closed, removed)
    }

    pub fn evict_stale(&self) -> (usize, usize) {
        self.evict_stale_at(Instant::now())
    }

    /// Close every live connection. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let now = Instant::now();
        let closed = self
            .entries
            .iter_mut()
            .filter_map(|mut entry| entry.close(now).then_some(()))
            .count();
        if closed > 0 {
            info!("Closed {} connections", closed);
        }
        closed
    }

    /// Connections that are PENDING or AUTHENTICATED.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state != ConnectionState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Duration::from_secs(300), Duration::from_secs(30))
    }

    #[test]
    fn test_register_and_authenticate() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register("c-1", tx).unwrap();
        assert_eq!(registry.state("c-1"), Some(ConnectionState::Pending));

        assert!(registry.authenticate("c-1", "user-42"));
        let snapshot = registry.lookup("c-1").unwrap();
        assert_eq!(snapshot.state, ConnectionState::Authenticated);
        assert_eq!(snapshot.user_id.as_deref(), Some("user-42"));

        // never twice
        assert!(!registry.authenticate("c-1", "user-7"));
        assert_eq!(registry.authenticated_user("c-1").as_deref(), Some("user-42"));
        assert!(!registry.authenticate("nope", "user-42"));
    }

    #[test]
    fn test_connection_id_validation() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(registry.register("   ", tx.clone()).is_err());
        assert!(registry.register(&"x".repeat(129), tx.clone()).is_err());
        assert!(registry.register("bad\u{0007}id", tx.clone()).is_err());
        let handle = registry.register("  padded  ", tx).unwrap();
        assert_eq!(handle.id(), "padded");
    }

    #[test]
    fn test_duplicate_live_id_refused() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = registry.register("c-1", tx.clone()).unwrap();
        assert!(matches!(
            registry.register("c-1", tx.clone()),
            Err(GatewayError::InvalidRequest(_))
        ));

        registry.release(&first);
        let second = registry.register("c-1", tx).unwrap();
        assert_eq!(registry.state("c-1"), Some(ConnectionState::Pending));

        // stale handle must not close the new registration
        registry.release(&first);
        assert_eq!(registry.state("c-1"), Some(ConnectionState::Pending));
        registry.release(&second);
        assert_eq!(registry.state("c-1"), Some(ConnectionState::Closed));
    }

    #[test]
    fn test_unregister_is_idempotent_and_cancels() {
        let registry = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = registry.register("c-1", tx).unwrap();
        assert!(registry.unregister("c-1"));
        assert!(!registry.unregister("c-1"));
        assert!(!registry.unregister("never-seen"));
        assert!(handle.is_closed());
        assert!(!handle.send(ServerMessage::Pong));
        assert!(!registry.authenticate("c-1", "user-42"));
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_try_authenticate_pushes_frame() {
        let registry = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("c-1", tx).unwrap();
        let user = UserIdentity::new("user-42", "a@example.com", 3.0);

        registry.try_authenticate("c-1", &user).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerMessage::Authenticated { user: user.clone() }
        );
        assert!(matches!(
            registry.try_authenticate("c-1", &user),
            Err(GatewayError::AlreadyAuthenticated(_))
        ));
        assert!(matches!(
            registry.try_authenticate("c-2", &user),
            Err(GatewayError::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_try_authenticate_with_writer_gone() {
        let registry = registry();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register("c-1", tx).unwrap();
        drop(rx);

        let user = UserIdentity::new("user-42", "a@example.com", 3.0);
        registry.try_authenticate("c-1", &user).unwrap();
        assert_eq!(registry.state("c-1"), Some(ConnectionState::Authenticated));
        assert!(!registry.send("c-1", ServerMessage::Pong));
    }

    #[test]
    fn test_evict_stale() {
        let registry = ConnectionRegistry::new(Duration::from_secs(10), Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = registry.register("pending", tx.clone()).unwrap();
        registry.register("authed", tx.clone()).unwrap();
        registry.authenticate("authed", "user-42");
        let start = Instant::now();

        assert_eq!(registry.evict_stale_at(start), (0, 0));

        let later = start + Duration::from_secs(11);
        assert_eq!(registry.evict_stale_at(later), (1, 0));
        assert!(pending.is_closed());
        assert_eq!(registry.state("pending"), Some(ConnectionState::Closed));
        assert_eq!(registry.state("authed"), Some(ConnectionState::Authenticated));
        assert!(matches!(rx.try_recv(), Ok(ServerMessage::Error { .. })));

        // tombstone reaped after retention
        assert_eq!(registry.evict_stale_at(later + Duration::from_secs(6)), (0, 1));
        assert!(registry.lookup("pending").is_none());
        assert!(registry.lookup("authed").is_some());
    }

    #[test]
    fn test_authenticate_races_unregister() {
        let registry = Arc::new(registry());
        for i in 0..50 {
            let id = format!("c-{}", i);
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(&id, tx).unwrap();

            let a = {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.authenticate(&id, "user-42"))
            };
            let b = {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || registry.unregister(&id))
            };
            let authed = a.join().unwrap();
            let closed = b.join().unwrap();

            // both may succeed in either order, but the end state is always CLOSED
            assert!(closed);
            let snapshot = registry.lookup(&id).unwrap();
            assert_eq!(snapshot.state, ConnectionState::Closed);
            if authed {
                assert_eq!(snapshot.user_id.as_deref(), Some("user-42"));
            } else {
                assert!(snapshot.user_id.is_none());
            }
        }
    }
}
