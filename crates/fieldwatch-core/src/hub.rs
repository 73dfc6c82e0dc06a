//! Broadcast hub for fieldwatch.
//!
//! The hub owns the project rooms, the session registry, and one bounded
//! outbound queue per connection. Transport code feeds it connection
//! lifecycle and client events; the hub updates the registry and fans the
//! resulting server events out to room members.
//!
//! Every operation is synchronous. Fan-out uses `try_send`, so a peer with a
//! full queue loses that event and the broadcaster never waits on it.

use crate::connection::ConnectionId;
use crate::room::{ProjectId, Room};
use crate::session::{now_millis, Session, SessionRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fieldwatch_protocol::{ClientEvent, Location, ProtocolError, Role, ServerEvent};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, trace, warn};

/// Hub errors.
///
/// None of these are reported back to clients; the event is dropped.
#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed event.
    #[error("Invalid event: {0}")]
    Invalid(#[from] ProtocolError),

    /// Connection was never registered or has already closed.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// Connection is already registered.
    #[error("Connection already registered: {0}")]
    AlreadyConnected(ConnectionId),

    /// Connection publishes to a project it never joined.
    #[error("Connection has not joined project: {0}")]
    NotJoined(ProjectId),

    /// Maximum connections reached.
    #[error("Maximum connections reached")]
    MaxConnectionsReached,

    /// Maximum projects reached.
    #[error("Maximum projects reached")]
    MaxProjectsReached,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of open connections.
    pub max_connections: usize,
    /// Maximum number of projects with at least one member.
    pub max_projects: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            max_projects: 10_000,
            outbound_capacity: 256,
        }
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, no join yet.
    Unjoined,
    /// Joined; holds the most recently joined project.
    Joined(ProjectId),
    /// Disconnected or never seen.
    Closed,
}

/// Receiving half of a connection's outbound queue.
pub type Outbound = mpsc::Receiver<Arc<ServerEvent>>;

/// Per-connection bookkeeping.
struct ConnectionEntry {
    outbound: mpsc::Sender<Arc<ServerEvent>>,
    /// Every room joined so far. A later join does not leave earlier rooms.
    rooms: HashSet<ProjectId>,
    current: Option<ProjectId>,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Event was queued for this many connections.
    pub delivered: usize,
    /// Event was dropped for this many connections (full or closed queue).
    pub dropped: usize,
}

impl FanoutReport {
    /// Total recipients the event was addressed to.
    #[must_use]
    pub fn recipients(&self) -> usize {
        self.delivered + self.dropped
    }
}

/// A session ended by a disconnect.
#[derive(Debug, Clone)]
pub struct Departure {
    /// The removed session, marked offline.
    pub session: Session,
    /// Delivery of the `enumerator_offline` announcement.
    pub report: FanoutReport,
}

/// Hub statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Open connections.
    pub connection_count: usize,
    /// Projects with at least one member.
    pub project_count: usize,
    /// Live enumerator sessions.
    pub session_count: usize,
}

/// Source of "now" in unix milliseconds.
pub type Clock = fn() -> u64;

/// The broadcast hub.
pub struct Hub {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<ProjectId, Room>,
    registry: SessionRegistry,
    config: HubConfig,
    clock: Clock,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        Self::with_clock(config, now_millis)
    }

    /// Create a hub with a custom clock.
    #[must_use]
    pub fn with_clock(config: HubConfig, clock: Clock) -> Self {
        info!("Creating hub with config: {:?}", config);
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            registry: SessionRegistry::new(),
            config,
            clock,
        }
    }

    /// Get the session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connection_count: self.connections.len(),
            project_count: self.rooms.len(),
            session_count: self.registry.len(),
        }
    }

    /// Get the lifecycle state of a connection.
    #[must_use]
    pub fn connection_state(&self, connection_id: &ConnectionId) -> ConnectionState {
        match self.connections.get(connection_id) {
            Some(entry) => match &entry.current {
                Some(project) => ConnectionState::Joined(project.clone()),
                None => ConnectionState::Unjoined,
            },
            None => ConnectionState::Closed,
        }
    }

    /// Number of connections in a project's room.
    #[must_use]
    pub fn member_count(&self, project_id: &str) -> usize {
        self.rooms
            .get(project_id)
            .map(|room| room.member_count())
            .unwrap_or(0)
    }

    /// Check if a connection is in a project's room.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, project_id: &str) -> bool {
        self.rooms
            .get(project_id)
            .map(|room| room.is_member(connection_id))
            .unwrap_or(false)
    }

    /// Register a new connection.
    ///
    /// Returns the receiving half of its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection limit is reached or the ID is taken.
    pub fn connect(&self, connection_id: ConnectionId) -> Result<Outbound, HubError> {
        if self.connections.len() >= self.config.max_connections {
            return Err(HubError::MaxConnectionsReached);
        }

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));

        match self.connections.entry(connection_id.clone()) {
            Entry::Occupied(_) => Err(HubError::AlreadyConnected(connection_id)),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    outbound: tx,
                    rooms: HashSet::new(),
                    current: None,
                });
                debug!(connection = %connection_id, "Connection registered");
                Ok(rx)
            }
        }
    }

    /// Dispatch a decoded client event.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is invalid or not allowed for this
    /// connection. Nothing has been mutated when an error is returned.
    pub fn handle(
        &self,
        connection_id: &ConnectionId,
        event: ClientEvent,
    ) -> Result<FanoutReport, HubError> {
        event.validate()?;

        match event {
            ClientEvent::Join {
                enumerator_id,
                project_id,
                role,
            } => self.join(connection_id, enumerator_id.as_deref(), &project_id, role),
            ClientEvent::Telemetry {
                project_id,
                enumerator_id,
                data,
            } => self.telemetry(connection_id, &project_id, &enumerator_id, data),
            ClientEvent::LocationPing {
                project_id,
                enumerator_id,
                location,
            } => self.location_ping(connection_id, &project_id, &enumerator_id, location),
        }
    }

    /// Join a connection to a project's room.
    ///
    /// Enumerators get a session and an `enumerator_online` announcement to
    /// the whole room, themselves included. Supervisors only join the room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown, an enumerator has no
    /// identity, or the project limit is reached.
    pub fn join(
        &self,
        connection_id: &ConnectionId,
        enumerator_id: Option<&str>,
        project_id: &str,
        role: Role,
    ) -> Result<FanoutReport, HubError> {
        let enumerator_id = match (role, enumerator_id) {
            (Role::Enumerator, Some(id)) => Some(id),
            (Role::Enumerator, None) => {
                return Err(ProtocolError::Invalid(
                    "enumeratorId is required for enumerators".to_string(),
                )
                .into())
            }
            (Role::Supervisor, _) => None,
        };

        if !self.rooms.contains_key(project_id) && self.rooms.len() >= self.config.max_projects {
            return Err(HubError::MaxProjectsReached);
        }

        {
            let mut entry = self
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))?;
            entry.rooms.insert(project_id.to_string());
            entry.current = Some(project_id.to_string());
        }

        self.rooms
            .entry(project_id.to_string())
            .or_insert_with(|| {
                debug!(project = %project_id, "Creating room");
                Room::new(project_id)
            })
            .join(connection_id.clone());

        let Some(enumerator_id) = enumerator_id else {
            debug!(connection = %connection_id, project = %project_id, "Supervisor joined");
            return Ok(FanoutReport::default());
        };

        let now = (self.clock)();
        if let Some(old) = self
            .registry
            .upsert(enumerator_id, connection_id, project_id, now)
        {
            if old.connection_id != *connection_id {
                // The old connection keeps its room membership until it closes.
                info!(
                    enumerator = %enumerator_id,
                    old_connection = %old.connection_id,
                    connection = %connection_id,
                    "Enumerator re-joined from a new connection"
                );
            }
        }

        let report = self.broadcast_all(project_id, ServerEvent::enumerator_online(enumerator_id));
        info!(
            enumerator = %enumerator_id,
            connection = %connection_id,
            project = %project_id,
            "Enumerator online"
        );
        Ok(report)
    }

    /// Mirror telemetry to the rest of the room and refresh the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or has not joined the
    /// project.
    pub fn telemetry(
        &self,
        connection_id: &ConnectionId,
        project_id: &str,
        enumerator_id: &str,
        data: serde_json::Value,
    ) -> Result<FanoutReport, HubError> {
        self.ensure_joined(connection_id, project_id)?;

        let now = (self.clock)();
        let report = self.broadcast_except(
            project_id,
            connection_id,
            ServerEvent::LiveUpdate {
                enumerator_id: enumerator_id.to_string(),
                data,
                timestamp: now,
            },
        );
        self.registry.touch(enumerator_id, now);

        trace!(
            enumerator = %enumerator_id,
            project = %project_id,
            recipients = report.recipients(),
            "Telemetry relayed"
        );
        Ok(report)
    }

    /// Relay a location to the rest of the room and record it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or has not joined the
    /// project.
    pub fn location_ping(
        &self,
        connection_id: &ConnectionId,
        project_id: &str,
        enumerator_id: &str,
        location: Location,
    ) -> Result<FanoutReport, HubError> {
        self.ensure_joined(connection_id, project_id)?;

        let now = (self.clock)();
        let report = self.broadcast_except(
            project_id,
            connection_id,
            ServerEvent::LocationUpdate {
                enumerator_id: enumerator_id.to_string(),
                location,
            },
        );
        self.registry.update_location(enumerator_id, location, now);

        trace!(
            enumerator = %enumerator_id,
            project = %project_id,
            recipients = report.recipients(),
            "Location relayed"
        );
        Ok(report)
    }

    /// Tear down a connection.
    ///
    /// Leaves every room the connection joined and removes the session bound
    /// to it, announcing `enumerator_offline` to the session's project.
    /// Returns `None` when the connection had no session; calling this twice
    /// is harmless.
    pub fn disconnect(&self, connection_id: &ConnectionId) -> Option<Departure> {
        if let Some((_, entry)) = self.connections.remove(connection_id) {
            for project_id in &entry.rooms {
                if let Some(mut room) = self.rooms.get_mut(project_id) {
                    room.leave(connection_id);
                }
                if self
                    .rooms
                    .remove_if(project_id, |_, room| room.is_empty())
                    .is_some()
                {
                    debug!(project = %project_id, "Deleted empty room");
                }
            }
            debug!(connection = %connection_id, "Connection unregistered");
        }

        let session = self.registry.remove_by_connection(connection_id)?;
        let report = self.broadcast_all(
            &session.project_id,
            ServerEvent::enumerator_offline(session.enumerator_id.clone()),
        );

        info!(
            enumerator = %session.enumerator_id,
            connection = %connection_id,
            project = %session.project_id,
            "Enumerator offline"
        );

        Some(Departure { session, report })
    }

    /// Send an event to every member of a project.
    pub fn broadcast_all(&self, project_id: &str, event: ServerEvent) -> FanoutReport {
        let recipients = self
            .rooms
            .get(project_id)
            .map(|room| room.members())
            .unwrap_or_default();
        self.fan_out(project_id, recipients, event)
    }

    /// Send an event to every member of a project except `sender`.
    pub fn broadcast_except(
        &self,
        project_id: &str,
        sender: &ConnectionId,
        event: ServerEvent,
    ) -> FanoutReport {
        let recipients = self
            .rooms
            .get(project_id)
            .map(|room| room.members_except(sender))
            .unwrap_or_default();
        self.fan_out(project_id, recipients, event)
    }

    fn fan_out(
        &self,
        project_id: &str,
        recipients: Vec<ConnectionId>,
        event: ServerEvent,
    ) -> FanoutReport {
        let event = Arc::new(event);
        let mut report = FanoutReport::default();

        for recipient in recipients {
            let Some(entry) = self.connections.get(&recipient) else {
                // Closed between the room snapshot and now.
                continue;
            };

            match entry.outbound.try_send(Arc::clone(&event)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!(
                        connection = %recipient,
                        project = %project_id,
                        event = event.name(),
                        "Outbound queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    report.dropped += 1;
                    debug!(connection = %recipient, "Outbound queue closed");
                }
            }
        }

        report
    }

    fn ensure_joined(&self, connection_id: &ConnectionId, project_id: &str) -> Result<(), HubError> {
        let entry = self
            .connections
            .get(connection_id)
            .ok_or_else(|| HubError::UnknownConnection(connection_id.clone()))?;

        if entry.rooms.contains(project_id) {
            Ok(())
        } else {
            Err(HubError::NotJoined(project_id.to_string()))
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
