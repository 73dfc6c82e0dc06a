//! Session registry for fieldwatch.
//!
//! A session records one enumerator's live presence in a project: which
//! connection currently speaks for the identity, when it was last heard
//! from, and where it last reported being. Supervisors never get a session.
//!
//! Every operation touches a single key of a sharded map, so operations are
//! atomic with respect to each other without a registry-wide lock.

use crate::connection::ConnectionId;
use dashmap::DashMap;
use fieldwatch_protocol::{Location, SessionStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One enumerator's live presence in a project.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Client-asserted identity, unique in the registry.
    pub enumerator_id: String,
    /// Connection currently associated with this identity.
    pub connection_id: ConnectionId,
    /// Project the session belongs to. Never changes.
    pub project_id: String,
    /// `Active` while registered, `Offline` once removed.
    pub status: SessionStatus,
    /// Unix milliseconds of the last inbound message.
    pub last_seen_at: u64,
    /// Last reported location.
    pub location: Option<Location>,
    /// Registry-wide join order.
    #[serde(skip)]
    pub joined_seq: u64,
}

/// Registry of live enumerator sessions, keyed by enumerator ID.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the session for an identity.
    ///
    /// Returns the session that was replaced, if any.
    pub fn upsert(
        &self,
        enumerator_id: &str,
        connection_id: &ConnectionId,
        project_id: &str,
        now: u64,
    ) -> Option<Session> {
        let session = Session {
            enumerator_id: enumerator_id.to_string(),
            connection_id: connection_id.clone(),
            project_id: project_id.to_string(),
            status: SessionStatus::Active,
            last_seen_at: now,
            location: None,
            joined_seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };

        let replaced = self.sessions.insert(enumerator_id.to_string(), session);

        match &replaced {
            Some(old) => debug!(
                enumerator = %enumerator_id,
                old_connection = %old.connection_id,
                connection = %connection_id,
                project = %project_id,
                "Session replaced"
            ),
            None => debug!(
                enumerator = %enumerator_id,
                connection = %connection_id,
                project = %project_id,
                "Session created"
            ),
        }

        replaced
    }

    /// Update the last seen timestamp of an identity.
    ///
    /// Returns `false` if the identity has no session.
    pub fn touch(&self, enumerator_id: &str, now: u64) -> bool {
        match self.sessions.get_mut(enumerator_id) {
            Some(mut session) => {
                session.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Record a new location for an identity.
    ///
    /// Returns `false` if the identity has no session.
    pub fn update_location(&self, enumerator_id: &str, location: Location, now: u64) -> bool {
        match self.sessions.get_mut(enumerator_id) {
            Some(mut session) => {
                session.location = Some(location);
                session.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Remove the session bound to a connection.
    ///
    /// Removes at most one session. If the connection speaks for several
    /// identities, the one joined first is removed and the rest stay until
    /// their own connection closes. The returned session is marked
    /// `Offline`.
    pub fn remove_by_connection(&self, connection_id: &ConnectionId) -> Option<Session> {
        loop {
            let (key, seq) = self
                .sessions
                .iter()
                .filter(|entry| entry.connection_id == *connection_id)
                .min_by_key(|entry| entry.joined_seq)
                .map(|entry| (entry.key().clone(), entry.joined_seq))?;

            let removed = self.sessions.remove_if(&key, |_, session| {
                session.connection_id == *connection_id && session.joined_seq == seq
            });

            if let Some((_, mut session)) = removed {
                session.status = SessionStatus::Offline;
                debug!(
                    enumerator = %session.enumerator_id,
                    connection = %connection_id,
                    project = %session.project_id,
                    "Session removed"
                );
                return Some(session);
            }
            // The identity was re-joined or removed after the scan; look again.
        }
    }

    /// Get a snapshot of an identity's session.
    #[must_use]
    pub fn get(&self, enumerator_id: &str) -> Option<Session> {
        self.sessions.get(enumerator_id).map(|s| s.value().clone())
    }

    /// Check if an identity has a session.
    #[must_use]
    pub fn contains(&self, enumerator_id: &str) -> bool {
        self.sessions.contains_key(enumerator_id)
    }

    /// Snapshot of the sessions in a project, in join order.
    #[must_use]
    pub fn sessions_in(&self, project_id: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by_key(|s| s.joined_seq);
        sessions
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
