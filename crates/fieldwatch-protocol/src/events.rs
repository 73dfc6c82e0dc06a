//! Event types for the fieldwatch protocol.
//!
//! Every frame carries exactly one event envelope:
//!
//! ```json
//! { "event": "telemetry", "data": { "projectId": "P1", "enumeratorId": "E1", "data": "x" } }
//! ```
//!
//! Field names inside `data` are camelCase. Inbound events are decoded into
//! [`ClientEvent`] and checked with [`ClientEvent::validate`] before they
//! reach the hub; outbound events are [`ServerEvent`]s.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};

/// Maximum length of an enumerator or project identifier, in bytes.
pub const MAX_ID_LENGTH: usize = 256;

/// Validate an identifier field.
///
/// # Errors
///
/// Returns [`ProtocolError::Invalid`] naming the field if the value is empty,
/// too long, or contains control characters.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::Invalid(format!("{field} cannot be empty")));
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ProtocolError::Invalid(format!("{field} too long")));
    }
    if value.chars().any(char::is_control) {
        return Err(ProtocolError::Invalid(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

/// Role asserted by a client when joining a project.
///
/// Anything other than `"enumerator"` is treated as a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    /// Streams telemetry and location into a project.
    Enumerator,
    /// Watches a project; never tracked as a session.
    Supervisor,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Enumerator => "enumerator",
            Role::Supervisor => "supervisor",
        }
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        if value == "enumerator" {
            Role::Enumerator
        } else {
            Role::Supervisor
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> String {
        role.as_str().to_string()
    }
}

/// A GPS fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl Location {
    /// Create a new location.
    #[must_use]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check that both coordinates are finite and in range.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] if either coordinate is out of range.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(ProtocolError::Invalid(format!(
                "latitude out of range: {}",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(ProtocolError::Invalid(format!(
                "longitude out of range: {}",
                self.lng
            )));
        }
        Ok(())
    }
}

/// Liveness status of an enumerator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Offline,
}

/// Inbound event kinds, used as log fields and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Join,
    Telemetry,
    LocationPing,
}

impl EventKind {
    /// Wire name of the event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Join => "join",
            EventKind::Telemetry => "telemetry",
            EventKind::LocationPing => "location_ping",
        }
    }
}

/// An event sent by a client to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a project room.
    #[serde(rename_all = "camelCase")]
    Join {
        /// Asserted identity. Required for enumerators, optional for supervisors.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        enumerator_id: Option<String>,
        /// Project to join.
        project_id: String,
        /// Asserted role.
        role: Role,
    },

    /// Keystroke / input-state mirror.
    #[serde(rename_all = "camelCase")]
    Telemetry {
        project_id: String,
        enumerator_id: String,
        /// Opaque payload relayed verbatim.
        data: serde_json::Value,
    },

    /// GPS location update.
    #[serde(rename_all = "camelCase")]
    LocationPing {
        project_id: String,
        enumerator_id: String,
        location: Location,
    },
}

impl ClientEvent {
    /// Create a join event.
    #[must_use]
    pub fn join(
        enumerator_id: impl Into<String>,
        project_id: impl Into<String>,
        role: Role,
    ) -> Self {
        ClientEvent::Join {
            enumerator_id: Some(enumerator_id.into()),
            project_id: project_id.into(),
            role,
        }
    }

    /// Create a telemetry event.
    #[must_use]
    pub fn telemetry(
        project_id: impl Into<String>,
        enumerator_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        ClientEvent::Telemetry {
            project_id: project_id.into(),
            enumerator_id: enumerator_id.into(),
            data,
        }
    }

    /// Create a location ping event.
    #[must_use]
    pub fn location_ping(
        project_id: impl Into<String>,
        enumerator_id: impl Into<String>,
        location: Location,
    ) -> Self {
        ClientEvent::LocationPing {
            project_id: project_id.into(),
            enumerator_id: enumerator_id.into(),
            location,
        }
    }

    /// Get the event kind.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Join { .. } => EventKind::Join,
            ClientEvent::Telemetry { .. } => EventKind::Telemetry,
            ClientEvent::LocationPing { .. } => EventKind::LocationPing,
        }
    }

    /// Get the project the event targets.
    #[must_use]
    pub fn project_id(&self) -> &str {
        match self {
            ClientEvent::Join { project_id, .. }
            | ClientEvent::Telemetry { project_id, .. }
            | ClientEvent::LocationPing { project_id, .. } => project_id,
        }
    }

    /// Check field contents that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Invalid`] describing the first bad field.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            ClientEvent::Join {
                enumerator_id,
                project_id,
                role,
            } => {
                validate_id("projectId", project_id)?;
                match (role, enumerator_id) {
                    (Role::Enumerator, None) => Err(ProtocolError::Invalid(
                        "enumeratorId is required for enumerators".to_string(),
                    )),
                    (_, Some(id)) => validate_id("enumeratorId", id),
                    (Role::Supervisor, None) => Ok(()),
                }
            }
            ClientEvent::Telemetry {
                project_id,
                enumerator_id,
                ..
            } => {
                validate_id("projectId", project_id)?;
                validate_id("enumeratorId", enumerator_id)
            }
            ClientEvent::LocationPing {
                project_id,
                enumerator_id,
                location,
            } => {
                validate_id("projectId", project_id)?;
                validate_id("enumeratorId", enumerator_id)?;
                location.validate()
            }
        }
    }
}

/// An event sent by the hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Greeting sent to a new connection only.
    #[serde(rename_all = "camelCase")]
    Connected {
        connection_id: String,
        version: String,
    },

    /// An enumerator joined the project.
    #[serde(rename_all = "camelCase")]
    EnumeratorOnline {
        enumerator_id: String,
        status: SessionStatus,
    },

    /// Mirrored telemetry from an enumerator.
    #[serde(rename_all = "camelCase")]
    LiveUpdate {
        enumerator_id: String,
        data: serde_json::Value,
        /// Unix milliseconds at which the hub relayed the update.
        timestamp: u64,
    },

    /// Location update from an enumerator.
    #[serde(rename_all = "camelCase")]
    LocationUpdate {
        enumerator_id: String,
        location: Location,
    },

    /// An enumerator's connection closed.
    #[serde(rename_all = "camelCase")]
    EnumeratorOffline { enumerator_id: String },
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::EnumeratorOnline { .. } => "enumerator_online",
            ServerEvent::LiveUpdate { .. } => "live_update",
            ServerEvent::LocationUpdate { .. } => "location_update",
            ServerEvent::EnumeratorOffline { .. } => "enumerator_offline",
        }
    }

    /// Create a connected greeting.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>) -> Self {
        ServerEvent::Connected {
            connection_id: connection_id.into(),
            version: crate::PROTOCOL_VERSION.to_string(),
        }
    }

    /// Create an online announcement.
    #[must_use]
    pub fn enumerator_online(enumerator_id: impl Into<String>) -> Self {
        ServerEvent::EnumeratorOnline {
            enumerator_id: enumerator_id.into(),
            status: SessionStatus::Active,
        }
    }

    /// Create an offline announcement.
    #[must_use]
    pub fn enumerator_offline(enumerator_id: impl Into<String>) -> Self {
        ServerEvent::EnumeratorOffline {
            enumerator_id: enumerator_id.into(),
        }
    }

    /// Get the enumerator this event is about, if any.
    #[must_use]
    pub fn enumerator_id(&self) -> Option<&str> {
        match self {
            ServerEvent::Connected { .. } => None,
            ServerEvent::EnumeratorOnline { enumerator_id, .. }
            | ServerEvent::LiveUpdate { enumerator_id, .. }
            | ServerEvent::LocationUpdate { enumerator_id, .. }
            | ServerEvent::EnumeratorOffline { enumerator_id } => Some(enumerator_id),
        }
    }
}
