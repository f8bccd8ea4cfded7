//! The session directory: every session a node currently hosts, the
//! relocations it has agreed to receive, and where recently departed
//! sessions went.
//!
//! # Concurrency note
//!
//! `SessionDirectory` is a plain data structure with `&mut self` methods.
//! The node wraps it in a `std::sync::Mutex` and never holds that lock
//! across an `.await`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::{Identity, NodeId, RelocationKey, SessionConfig, SessionError, SessionId};

/// A relocation this node has agreed to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelocation {
    pub session_id: SessionId,
    pub identity: Identity,
    /// The node that currently holds the session.
    pub source: NodeId,
}

#[derive(Debug)]
struct PendingEntry {
    relocation: PendingRelocation,
    deadline: Instant,
}

#[derive(Debug)]
struct MovedEntry {
    node: NodeId,
    deadline: Instant,
}

/// Registry of local sessions keyed by [`SessionId`], with a table of
/// pending inbound relocations keyed by [`RelocationKey`].
///
/// ```text
/// register() ──→ [hosted] ──→ remove()
///
/// reserve_relocation() ──→ [pending] ──→ take_relocation() ──→ register()
///                              │
///                              ▼ (after relocation_timeout)
///                        expire_stale()
///
/// [hosted] ──depart()──→ [moved] ──(after relocation_timeout)──→ expire_stale()
/// ```
///
/// A moved entry lets traffic routed here by peers with a stale view still
/// reach the session's new node.
#[derive(Debug)]
pub struct SessionDirectory<T> {
    sessions: HashMap<SessionId, T>,
    pending: HashMap<RelocationKey, PendingEntry>,
    moved: HashMap<SessionId, MovedEntry>,
    relocation_timeout: Duration,
}

impl<T> SessionDirectory<T> {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: HashMap::new(),
            pending: HashMap::new(),
            moved: HashMap::new(),
            relocation_timeout: config.relocation_timeout,
        }
    }

    /// Adds a session hosted by this node.
    ///
    /// # Errors
    /// Returns [`SessionError::AlreadyRegistered`] if `id` is present.
    pub fn register(&mut self, id: SessionId, session: T) -> Result<(), SessionError> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::AlreadyRegistered(id));
        }
        self.moved.remove(&id);
        self.sessions.insert(id, session);
        tracing::debug!(session_id = %id, "session registered");
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<&T> {
        self.sessions.get(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<T> {
        let removed = self.sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, "session removed");
        }
        removed
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Removes a session that relocated to `node`, remembering the route
    /// until the relocation timeout elapses.
    pub fn depart(&mut self, id: &SessionId, node: NodeId) -> Option<T> {
        let removed = self.sessions.remove(id)?;
        self.moved.insert(
            *id,
            MovedEntry {
                node,
                deadline: Instant::now() + self.relocation_timeout,
            },
        );
        tracing::debug!(session_id = %id, %node, "session departed");
        Some(removed)
    }

    /// Where a recently departed session went.
    pub fn moved_to(&self, id: &SessionId) -> Option<NodeId> {
        self.moved
            .get(id)
            .filter(|entry| Instant::now() < entry.deadline)
            .map(|entry| entry.node)
    }

    /// Drains every hosted session, used at shutdown.
    pub fn drain(&mut self) -> Vec<(SessionId, T)> {
        self.sessions.drain().collect()
    }

    // -- relocations ------------------------------------------------------

    /// Records that a client holding `key` may claim `relocation` until the
    /// relocation timeout elapses.
    ///
    /// # Errors
    /// Returns [`SessionError::DuplicateRelocationKey`] if `key` is pending.
    pub fn reserve_relocation(
        &mut self,
        key: RelocationKey,
        relocation: PendingRelocation,
    ) -> Result<(), SessionError> {
        if self.pending.contains_key(&key) {
            return Err(SessionError::DuplicateRelocationKey);
        }
        tracing::debug!(
            session_id = %relocation.session_id,
            source = %relocation.source,
            "relocation reserved"
        );
        self.pending.insert(
            key,
            PendingEntry {
                relocation,
                deadline: Instant::now() + self.relocation_timeout,
            },
        );
        Ok(())
    }

    /// Consumes the pending relocation for `key`. A key can be used once.
    ///
    /// # Errors
    /// - [`SessionError::InvalidRelocationKey`] if `key` is unknown
    /// - [`SessionError::RelocationExpired`] if its deadline has passed
    pub fn take_relocation(
        &mut self,
        key: &RelocationKey,
    ) -> Result<PendingRelocation, SessionError> {
        let entry = self
            .pending
            .remove(key)
            .ok_or(SessionError::InvalidRelocationKey)?;
        if Instant::now() >= entry.deadline {
            return Err(SessionError::RelocationExpired(entry.relocation.session_id));
        }
        Ok(entry.relocation)
    }

    /// Withdraws a reservation whose source gave up before the client was
    /// told about it. Returns `false` if `key` was not pending.
    pub fn cancel_relocation(&mut self, key: &RelocationKey) -> bool {
        let cancelled = self.pending.remove(key);
        if let Some(entry) = &cancelled {
            tracing::debug!(session_id = %entry.relocation.session_id, "relocation cancelled");
        }
        cancelled.is_some()
    }

    /// Whether a relocation for `id` is waiting on this node.
    pub fn is_relocation_pending(&self, id: &SessionId) -> bool {
        self.pending
            .values()
            .any(|entry| entry.relocation.session_id == *id)
    }

    /// Drops pending relocations and moved routes whose deadline has passed.
    /// Returns the expired relocations.
    pub fn expire_stale(&mut self) -> Vec<PendingRelocation> {
        let now = Instant::now();
        self.moved.retain(|_, entry| now < entry.deadline);
        let mut expired = Vec::new();
        self.pending.retain(|_, entry| {
            if now >= entry.deadline {
                tracing::info!(
                    session_id = %entry.relocation.session_id,
                    "pending relocation expired"
                );
                expired.push(entry.relocation.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn pending_relocations(&self) -> usize {
        self.pending.len()
    }
}
