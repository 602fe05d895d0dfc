//! Entity and world state records

use std::collections::BTreeMap;
use std::sync::Arc;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::EntityId;

/// Look orientation in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rotation {
    pub yaw: f32,
    pub pitch: f32,
}

impl Rotation {
    pub fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }
}

/// Simulation constants fixed per entity type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyProfile {
    /// Collision sphere radius
    pub radius: f32,
    pub mass: f32,
    /// Bounciness (0 = dead stop, 1 = perfectly elastic)
    pub restitution: f32,
    pub max_health: f32,
    /// Static bodies never move and have infinite mass
    #[serde(default)]
    pub is_static: bool,
}

impl BodyProfile {
    /// Player-sized capsule approximated by a sphere
    pub fn player() -> Self {
        Self {
            radius: 0.5,
            mass: 80.0,
            restitution: 0.2,
            max_health: 100.0,
            is_static: false,
        }
    }

    /// Immovable scenery sphere
    pub fn obstacle(radius: f32) -> Self {
        Self {
            radius,
            mass: 0.0,
            restitution: 0.5,
            max_health: 100.0,
            is_static: true,
        }
    }

    pub fn dynamic(radius: f32, mass: f32, restitution: f32) -> Self {
        Self {
            radius,
            mass,
            restitution,
            max_health: 100.0,
            is_static: false,
        }
    }

    /// Zero for static or massless bodies
    pub fn inverse_mass(&self) -> f32 {
        if self.is_static || self.mass <= 0.0 || !self.mass.is_finite() {
            0.0
        } else {
            1.0 / self.mass
        }
    }
}

impl Default for BodyProfile {
    fn default() -> Self {
        Self::player()
    }
}

/// Physical state of one entity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub position: Vec3,
    pub velocity: Vec3,
    #[serde(default)]
    pub rotation: Rotation,
    pub health: f32,
    #[serde(default)]
    pub on_ground: bool,
    pub body: BodyProfile,
}

impl EntityState {
    /// Resting entity at full health
    pub fn new(position: Vec3, body: BodyProfile) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            rotation: Rotation::default(),
            health: body.max_health,
            on_ground: false,
            body,
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    pub fn with_health(mut self, health: f32) -> Self {
        self.health = health;
        self.clamp_health();
        self
    }

    /// Keep health inside `[0, max_health]`, treating NaN as dead
    pub fn clamp_health(&mut self) {
        self.health = if self.health.is_nan() {
            0.0
        } else {
            self.health.clamp(0.0, self.body.max_health.max(0.0))
        };
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite()
            && self.velocity.is_finite()
            && self.rotation.yaw.is_finite()
            && self.rotation.pitch.is_finite()
    }
}

/// Immutable world table plus the tick it was produced at.
///
/// Entities live behind an `Arc`, so cloning a world is cheap and the
/// simulator produces a fresh map instead of mutating a shared one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    tick: u64,
    entities: Arc<BTreeMap<EntityId, EntityState>>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(tick: u64, entities: impl IntoIterator<Item = (EntityId, EntityState)>) -> Self {
        Self {
            tick,
            entities: Arc::new(entities.into_iter().collect()),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityState> {
        self.entities.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Entities in id order
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &EntityState)> {
        self.entities.iter().map(|(id, state)| (*id, state))
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Copy of this world with one entity inserted or replaced
    pub fn with_entity(&self, id: EntityId, state: EntityState) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.entities).insert(id, state);
        next
    }

    /// Copy of this world without `id`
    pub fn without_entity(&self, id: EntityId) -> Self {
        if !self.contains(id) {
            return self.clone();
        }
        let mut next = self.clone();
        Arc::make_mut(&mut next.entities).remove(&id);
        next
    }

    pub(crate) fn from_map(tick: u64, entities: BTreeMap<EntityId, EntityState>) -> Self {
        Self {
            tick,
            entities: Arc::new(entities),
        }
    }

    pub(crate) fn entity_map(&self) -> &BTreeMap<EntityId, EntityState> {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_entity_leaves_original_untouched() {
        let base = WorldState::new().with_entity(EntityId(1), EntityState::new(Vec3::ZERO, BodyProfile::player()));
        let moved = base.with_entity(
            EntityId(1),
            EntityState::new(Vec3::new(5.0, 0.0, 0.0), BodyProfile::player()),
        );

        assert_eq!(base.get(EntityId(1)).map(|e| e.position), Some(Vec3::ZERO));
        assert_eq!(moved.get(EntityId(1)).map(|e| e.position.x), Some(5.0));
    }

    #[test]
    fn test_health_clamped() {
        let state = EntityState::new(Vec3::ZERO, BodyProfile::player()).with_health(250.0);
        assert_eq!(state.health, 100.0);
        let state = state.with_health(f32::NAN);
        assert_eq!(state.health, 0.0);
    }

    #[test]
    fn test_static_body_has_no_inverse_mass() {
        assert_eq!(BodyProfile::obstacle(2.0).inverse_mass(), 0.0);
        assert_eq!(BodyProfile::dynamic(1.0, 0.0, 0.5).inverse_mass(), 0.0);
        assert!((BodyProfile::dynamic(1.0, 2.0, 0.5).inverse_mass() - 0.5).abs() < 1e-6);
    }
}
