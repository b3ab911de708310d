//! Process-wide session registry: the single source of truth for live
//! sessions, keyed by id. Enumerations return point-in-time snapshots so
//! callers never touch the map during network I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::session::Session;

/// Concurrent id → session map plus the monotone id allocator. Ids are `s`
/// followed by decimal digits, unique for the lifetime of the process; no
/// persistence across restarts.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate the next session id: "s1", "s2", ...
    pub fn next_id(&self) -> String {
        format!("s{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn add(&self, session: Arc<Session>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn delete(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of all live sessions.
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Owner-filtered snapshot. An empty owner means "no filtering", the
    /// authentication-disabled case; the registry itself does not know
    /// whether auth is on, callers pass the principal or "".
    pub fn list_by_owner(&self, owner: &str) -> Vec<Arc<Session>> {
        if owner.is_empty() {
            return self.list();
        }
        self.sessions
            .iter()
            .filter(|entry| entry.value().owner() == owner)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Sessions currently attached to the named tmux session.
    pub fn list_by_tmux_session(&self, tmux_name: &str) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().tmux_session_name() == tmux_name)
            .map(|entry| entry.value().clone())
            .collect()
    }
}
