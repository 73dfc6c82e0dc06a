//! Project rooms.
//!
//! A room is the set of connections that joined a project. It is the unit of
//! broadcast scoping: events go to every member, or to every member except
//! the one that caused them.

use crate::connection::ConnectionId;
use std::collections::HashSet;
use tracing::debug;

/// A project identifier.
pub type ProjectId = String;

/// Connections currently joined to one project.
#[derive(Debug)]
pub struct Room {
    project_id: ProjectId,
    members: HashSet<ConnectionId>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(project_id: impl Into<ProjectId>) -> Self {
        Self {
            project_id: project_id.into(),
            members: HashSet::new(),
        }
    }

    /// Get the project this room belongs to.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Add a connection.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&mut self, connection_id: ConnectionId) -> bool {
        debug!(project = %self.project_id, connection = %connection_id, "Connection joined room");
        self.members.insert(connection_id)
    }

    /// Remove a connection.
    ///
    /// Returns `true` if the connection was a member.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id);
        if removed {
            debug!(project = %self.project_id, connection = %connection_id, "Connection left room");
        }
        removed
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains(connection_id)
    }

    /// Every member: the recipients of a presence event.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionId> {
        self.members.iter().cloned().collect()
    }

    /// Every member except `sender`: the recipients of a mirrored event.
    #[must_use]
    pub fn members_except(&self, sender: &ConnectionId) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|id| *id != sender)
            .cloned()
            .collect()
    }

    /// Number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
