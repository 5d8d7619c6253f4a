//! Session Registry
//!
//! Maps session ids to their live connections. Every connection that belongs
//! to any session is also a member of the distinguished [`ALL_SESSIONS`]
//! session, which always exists. Named sessions are created on first join and
//! removed as soon as their last member leaves.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::{ConnectionHandle, ConnectionId};

/// Session id that every registered connection belongs to.
pub const ALL_SESSIONS: &str = "all";

type Members = HashMap<ConnectionId, ConnectionHandle>;

/// Member count for one named session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub connections: usize,
}

struct Inner {
    sessions: HashMap<String, Members>,
    /// Reverse index: the sessions each connection joined explicitly.
    memberships: HashMap<ConnectionId, HashSet<String>>,
}

impl Inner {
    fn all_mut(&mut self) -> &mut Members {
        self.sessions.entry(ALL_SESSIONS.to_string()).or_default()
    }

    fn remove_member(&mut self, session_id: &str, id: ConnectionId) -> bool {
        let Some(members) = self.sessions.get_mut(session_id) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() && session_id != ALL_SESSIONS {
            self.sessions.remove(session_id);
            debug!(session = %session_id, "session emptied");
        }
        removed
    }
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(ALL_SESSIONS.to_string(), Members::new());
        Self {
            inner: RwLock::new(Inner {
                sessions,
                memberships: HashMap::new(),
            }),
        }
    }

    /// Add `conn` to `session_id` and to the "all" session.
    ///
    /// Idempotent. Returns true if the connection was not yet a member of
    /// `session_id`.
    pub async fn join(&self, conn: &ConnectionHandle, session_id: &str) -> bool {
        let id = conn.id();
        let mut inner = self.inner.write().await;

        let added = inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id, conn.clone())
            .is_none();
        inner
            .memberships
            .entry(id)
            .or_default()
            .insert(session_id.to_string());
        inner.all_mut().insert(id, conn.clone());

        if added {
            debug!(conn_id = %id, session = %session_id, "joined session");
        }
        added
    }

    /// Remove a connection from `session_id`.
    ///
    /// The connection also leaves "all" once it belongs to no other session.
    /// Leaving a session the connection never joined is a no-op. Returns true
    /// if the connection was a member.
    pub async fn leave(&self, id: ConnectionId, session_id: &str) -> bool {
        let mut inner = self.inner.write().await;

        let Some(joined) = inner.memberships.get_mut(&id) else {
            return false;
        };
        if !joined.remove(session_id) {
            return false;
        }
        let now_unattached = joined.is_empty();
        if now_unattached {
            inner.memberships.remove(&id);
        }

        if session_id != ALL_SESSIONS {
            inner.remove_member(session_id, id);
        }
        if now_unattached {
            inner.all_mut().remove(&id);
        }
        debug!(conn_id = %id, session = %session_id, "left session");
        true
    }

    /// Remove a connection from every session, including "all".
    ///
    /// Returns the sessions it was removed from.
    pub async fn leave_all(&self, id: ConnectionId) -> Vec<String> {
        let mut inner = self.inner.write().await;

        let joined: Vec<String> = inner
            .memberships
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for session_id in &joined {
            if session_id != ALL_SESSIONS {
                inner.remove_member(session_id, id);
            }
        }
        inner.all_mut().remove(&id);

        if !joined.is_empty() {
            debug!(conn_id = %id, sessions = joined.len(), "left all sessions");
        }
        joined
    }

    /// Snapshot of the connections in `session_id`. Empty for unknown sessions.
    pub async fn members(&self, session_id: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn member_count(&self, session_id: &str) -> usize {
        let inner = self.inner.read().await;
        inner.sessions.get(session_id).map_or(0, HashMap::len)
    }

    pub async fn contains(&self, session_id: &str, id: ConnectionId) -> bool {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .is_some_and(|members| members.contains_key(&id))
    }

    /// Number of sessions currently held, counting "all".
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Named sessions (excluding "all") with their member counts, sorted by id.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let inner = self.inner.read().await;
        let mut out: Vec<SessionSummary> = inner
            .sessions
            .iter()
            .filter(|(id, _)| id.as_str() != ALL_SESSIONS)
            .map(|(id, members)| SessionSummary {
                session_id: id.clone(),
                connections: members.len(),
            })
            .collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }
}
