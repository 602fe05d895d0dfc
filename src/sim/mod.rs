//! Deterministic simulation: entity state, spatial index and the step function
//! shared by prediction, reconciliation and the authority

pub mod physics;
pub mod spatial;
pub mod state;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use physics::{MovementTuning, PhysicsConfig, Simulator};
pub use spatial::SpatialIndex;
pub use state::{BodyProfile, EntityState, Rotation, WorldState};

/// Stable identifier of a simulated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Movement keys held during a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFlags {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
    pub crouch: bool,
    pub sprint: bool,
}

impl MovementFlags {
    pub fn any_direction(&self) -> bool {
        self.forward || self.back || self.left || self.right
    }
}

/// Non-movement actions held during a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFlags {
    pub fire: bool,
    pub reload: bool,
    pub aim: bool,
}

/// Camera rotation accumulated since the previous command, in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LookDelta {
    pub yaw: f32,
    pub pitch: f32,
}

impl LookDelta {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }

    pub fn is_finite(&self) -> bool {
        self.yaw.is_finite() && self.pitch.is_finite()
    }
}

/// One tick of player intent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Strictly increasing per client session
    pub sequence: u64,
    /// Client send time in milliseconds
    pub timestamp: f64,
    #[serde(default)]
    pub movement: MovementFlags,
    #[serde(default)]
    pub look_delta: LookDelta,
    #[serde(default)]
    pub actions: ActionFlags,
}

impl Command {
    pub fn new(sequence: u64, timestamp: f64) -> Self {
        Self {
            sequence,
            timestamp,
            movement: MovementFlags::default(),
            look_delta: LookDelta::default(),
            actions: ActionFlags::default(),
        }
    }

    pub fn with_movement(mut self, movement: MovementFlags) -> Self {
        self.movement = movement;
        self
    }

    pub fn with_look(mut self, look_delta: LookDelta) -> Self {
        self.look_delta = look_delta;
        self
    }

    /// Copy of this command with non-finite look deltas zeroed.
    /// The flag is true when something had to be replaced.
    pub fn sanitized(&self) -> (Command, bool) {
        if self.look_delta.is_finite() {
            return (*self, false);
        }
        let mut clean = *self;
        clean.look_delta = LookDelta::default();
        (clean, true)
    }
}
