//! Wire protocol message definitions
//! These are the text-frame types exchanged between a session and the authority

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sim::{Command, EntityId, EntityState, WorldState};

/// Messages sent from client to authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Open a session; the authority answers with `Welcome`
    Hello { session_id: Uuid },

    /// One tick of player intent
    Command { command: Command },

    /// Clock sync probe
    Ping {
        /// Client timestamp in ms, echoed back in `Pong`
        client_time: f64,
    },

    /// Leave the session
    Leave,
}

/// Messages sent from authority to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Session accepted and an entity assigned
    Welcome {
        session_id: Uuid,
        entity_id: EntityId,
        server_time: f64,
        tick_rate: u32,
    },

    /// Authoritative world state
    Snapshot(Snapshot),

    /// Entity no longer exists
    EntityRemoved { entity_id: EntityId },

    /// Answer to `Ping`
    Pong { client_time: f64, server_time: f64 },

    /// Error message
    Error { code: String, message: String },
}

/// One entity inside a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub state: EntityState,
}

/// Authoritative world state as seen by one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Authority clock in ms
    pub server_time: f64,
    /// Authority tick the state was taken after
    pub tick: u64,
    /// Highest command sequence from this client the authority has applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_input: Option<u64>,
    pub entities: Vec<EntitySnapshot>,
}

impl Snapshot {
    pub fn new(server_time: f64, tick: u64, last_processed_input: Option<u64>, world: &WorldState) -> Self {
        Self {
            server_time,
            tick,
            last_processed_input,
            entities: world
                .iter()
                .map(|(id, state)| EntitySnapshot { id, state: *state })
                .collect(),
        }
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.iter().find(|e| e.id == id).map(|e| &e.state)
    }

    /// Entities as a world table
    pub fn world(&self) -> WorldState {
        WorldState::from_entities(self.tick, self.entities.iter().map(|e| (e.id, e.state)))
    }

    /// Reject values no authority would produce
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(self.server_time.is_finite() && self.server_time >= 0.0) {
            return Err(ProtocolError::InvalidField("server_time"));
        }
        let mut seen = BTreeSet::new();
        for entity in &self.entities {
            if !seen.insert(entity.id) {
                return Err(ProtocolError::DuplicateEntity(entity.id));
            }
            validate_entity(entity.id, &entity.state)?;
        }
        Ok(())
    }
}

fn validate_entity(id: EntityId, state: &EntityState) -> Result<(), ProtocolError> {
    let body = &state.body;
    let invalid = |field| ProtocolError::InvalidEntity { id, field };

    if !state.is_finite() {
        return Err(invalid("transform"));
    }
    if !(body.radius.is_finite() && body.radius > 0.0) {
        return Err(invalid("radius"));
    }
    if !(body.mass.is_finite() && body.mass >= 0.0) || (!body.is_static && body.mass == 0.0) {
        return Err(invalid("mass"));
    }
    if !(0.0..=1.0).contains(&body.restitution) {
        return Err(invalid("restitution"));
    }
    if !(body.max_health.is_finite() && body.max_health >= 0.0) {
        return Err(invalid("max_health"));
    }
    if !(0.0..=body.max_health).contains(&state.health) {
        return Err(invalid("health"));
    }
    Ok(())
}

impl ClientMsg {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text)?;
        match &msg {
            ClientMsg::Command { command } => {
                if command.sequence == 0 {
                    return Err(ProtocolError::InvalidField("sequence"));
                }
                if !command.timestamp.is_finite() {
                    return Err(ProtocolError::InvalidField("timestamp"));
                }
            }
            ClientMsg::Ping { client_time } if !client_time.is_finite() => {
                return Err(ProtocolError::InvalidField("client_time"));
            }
            _ => {}
        }
        Ok(msg)
    }
}

impl ServerMsg {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate one frame; nothing malformed gets past here
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text)?;
        match &msg {
            ServerMsg::Snapshot(snapshot) => snapshot.validate()?,
            ServerMsg::Welcome { server_time, .. } if !server_time.is_finite() => {
                return Err(ProtocolError::InvalidField("server_time"));
            }
            ServerMsg::Pong {
                client_time,
                server_time,
            } if !(client_time.is_finite() && server_time.is_finite()) => {
                return Err(ProtocolError::InvalidField("pong"));
            }
            _ => {}
        }
        Ok(msg)
    }
}

/// Transport connection state changes surfaced to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnecting { attempt: u32 },
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid field: {0}")]
    InvalidField(&'static str),

    #[error("Entity {id} has invalid {field}")]
    InvalidEntity { id: EntityId, field: &'static str },

    #[error("Entity {0} listed twice")]
    DuplicateEntity(EntityId),
}
