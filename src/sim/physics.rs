//! Movement integration and sphere collision resolution

use std::collections::BTreeMap;
use std::f32::consts::FRAC_PI_2;
use std::ops::Bound;

use glam::Vec3;
use tracing::{debug, trace, warn};

use crate::config::{EngineConfig, WorldBounds};
use crate::util::math::{finite_or_zero, wrap_angle};

use super::spatial::SpatialIndex;
use super::state::{EntityState, WorldState};
use super::{Command, EntityId};

/// Gap left between spheres after positional correction
const SEPARATION_SLOP: f32 = 1e-3;
/// Below this centre distance the pair is treated as coincident
const COINCIDENT_EPSILON: f32 = 1e-6;
/// Rebound speeds under this settle on the floor instead of bouncing
const REST_SPEED: f32 = 1.0;
/// Tolerance for the on-ground check against the lower Y bound
const GROUND_EPSILON: f32 = 1e-4;
/// Upper bound on collide-then-clamp passes per step
const MAX_CONTACT_PASSES: usize = 32;

/// World-level physics settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsConfig {
    pub gravity: f32,
    /// Horizontal velocity multiplier per tick
    pub linear_damping: f32,
    pub bounds: WorldBounds,
    pub cell_size: f32,
}

impl From<&EngineConfig> for PhysicsConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            gravity: config.gravity,
            linear_damping: config.linear_damping,
            bounds: config.world_bounds,
            cell_size: config.cell_size,
        }
    }
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Player movement constants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementTuning {
    /// Base horizontal speed in units/s
    pub walk_speed: f32,
    pub sprint_multiplier: f32,
    pub crouch_multiplier: f32,
    /// Vertical speed given by a jump
    pub jump_speed: f32,
    /// Speed cap applied after integration
    pub max_speed: f32,
}

impl Default for MovementTuning {
    fn default() -> Self {
        Self {
            walk_speed: 5.0,
            sprint_multiplier: 1.6,
            crouch_multiplier: 0.4,
            jump_speed: 8.0,
            max_speed: 20.0,
        }
    }
}

impl MovementTuning {
    /// Horizontal speed for the given modifier keys; crouch wins over sprint
    pub fn speed_for(&self, sprint: bool, crouch: bool) -> f32 {
        if crouch {
            self.walk_speed * self.crouch_multiplier
        } else if sprint {
            self.walk_speed * self.sprint_multiplier
        } else {
            self.walk_speed
        }
    }
}

/// The deterministic step function.
///
/// Holds only configuration plus a scratch spatial index that is rebuilt on
/// every call, so two simulators with equal settings produce bit-identical
/// worlds from the same inputs.
#[derive(Debug, Clone)]
pub struct Simulator {
    config: PhysicsConfig,
    tuning: MovementTuning,
    index: SpatialIndex,
}

impl Simulator {
    pub fn new(config: PhysicsConfig) -> Self {
        Self {
            index: SpatialIndex::new(config.cell_size),
            config,
            tuning: MovementTuning::default(),
        }
    }

    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    /// Advance `world` by one tick of length `dt` seconds.
    ///
    /// Commands for ids that are not in the world are ignored.
    pub fn step(
        &mut self,
        world: &WorldState,
        commands: &BTreeMap<EntityId, Command>,
        dt: f32,
    ) -> WorldState {
        let dt = if dt.is_finite() && dt >= 0.0 {
            dt
        } else {
            warn!(dt, "Non-finite or negative timestep, treating as zero");
            0.0
        };

        for id in commands.keys() {
            if !world.contains(*id) {
                debug!(entity_id = %id, "Ignoring command for unknown entity");
            }
        }

        let previous = world.entity_map();
        let mut entities = previous.clone();

        self.integrate_velocities(&mut entities, commands, dt);

        for state in entities.values_mut().filter(|e| !e.body.is_static) {
            state.position += state.velocity * dt;
        }

        self.solve_contacts(&mut entities);

        for (id, state) in entities.iter_mut() {
            if !state.is_finite() {
                let before = previous.get(id).map(|e| e.position).unwrap_or(Vec3::ZERO);
                warn!(entity_id = %id, "Non-finite state after step, reverting position");
                state.position = if before.is_finite() { before } else { Vec3::ZERO };
                state.velocity = Vec3::ZERO;
                state.rotation.yaw = finite_or_zero(state.rotation.yaw);
                state.rotation.pitch = finite_or_zero(state.rotation.pitch);
            }
            state.clamp_health();
        }

        WorldState::from_map(world.tick() + 1, entities)
    }

    /// Step with a single command for one entity
    pub fn step_entity(
        &mut self,
        world: &WorldState,
        id: EntityId,
        command: &Command,
        dt: f32,
    ) -> WorldState {
        let mut commands = BTreeMap::new();
        commands.insert(id, *command);
        self.step(world, &commands, dt)
    }

    fn integrate_velocities(
        &self,
        entities: &mut BTreeMap<EntityId, EntityState>,
        commands: &BTreeMap<EntityId, Command>,
        dt: f32,
    ) {
        for (id, state) in entities.iter_mut() {
            if state.body.is_static {
                continue;
            }

            if let Some(command) = commands.get(id) {
                let (command, replaced) = command.sanitized();
                if replaced {
                    warn!(
                        entity_id = %id,
                        sequence = command.sequence,
                        "Sanitized non-finite look delta"
                    );
                }
                self.apply_command(state, &command);
            }

            state.velocity.y += self.config.gravity * dt;
            state.velocity.x *= self.config.linear_damping;
            state.velocity.z *= self.config.linear_damping;

            let speed = state.velocity.length();
            if speed > self.tuning.max_speed {
                state.velocity *= self.tuning.max_speed / speed;
            }
        }
    }

    fn apply_command(&self, state: &mut EntityState, command: &Command) {
        state.rotation.yaw = wrap_angle(state.rotation.yaw + command.look_delta.yaw);
        state.rotation.pitch =
            (state.rotation.pitch + command.look_delta.pitch).clamp(-FRAC_PI_2, FRAC_PI_2);

        let movement = &command.movement;
        if movement.any_direction() {
            let yaw = state.rotation.yaw;
            let forward = Vec3::new(-yaw.sin(), 0.0, -yaw.cos());
            let right = Vec3::new(yaw.cos(), 0.0, -yaw.sin());

            let mut wish = Vec3::ZERO;
            if movement.forward {
                wish += forward;
            }
            if movement.back {
                wish -= forward;
            }
            if movement.right {
                wish += right;
            }
            if movement.left {
                wish -= right;
            }

            // Opposite keys cancel out and leave the current velocity alone
            if let Some(dir) = wish.try_normalize() {
                let speed = self.tuning.speed_for(movement.sprint, movement.crouch);
                state.velocity.x = dir.x * speed;
                state.velocity.z = dir.z * speed;
            }
        }

        if movement.jump && state.on_ground {
            state.velocity.y = self.tuning.jump_speed;
            state.on_ground = false;
        }
    }

    /// Alternate pair resolution and bound clamping until a pass moves
    /// nothing, since either can push a settled body back into overlap.
    fn solve_contacts(&mut self, entities: &mut BTreeMap<EntityId, EntityState>) {
        for _ in 0..MAX_CONTACT_PASSES {
            let resolved = self.resolve_collisions(entities);

            let mut clamped = 0;
            for state in entities.values_mut().filter(|e| !e.body.is_static) {
                if clamp_to_bounds(state, &self.config.bounds) {
                    clamped += 1;
                }
            }

            if resolved == 0 && clamped == 0 {
                return;
            }
        }
        debug!(passes = MAX_CONTACT_PASSES, "Contacts still overlapping after solver passes");
    }

    /// One broadphase and pair pass. Returns the number of pairs pushed apart.
    fn resolve_collisions(&mut self, entities: &mut BTreeMap<EntityId, EntityState>) -> usize {
        self.index.clear();
        let mut max_radius: f32 = 0.0;
        for (id, state) in entities.iter() {
            self.index.insert(*id, state.position);
            max_radius = max_radius.max(state.body.radius);
        }

        let mut resolved = 0;
        let ids: Vec<EntityId> = entities.keys().copied().collect();
        for a in ids {
            let Some(origin) = entities.get(&a).copied() else {
                continue;
            };
            let candidates = self
                .index
                .query_neighbors(origin.position, origin.body.radius + max_radius);

            for b in candidates.range((Bound::Excluded(a), Bound::Unbounded)) {
                let (Some(mut state_a), Some(mut state_b)) =
                    (entities.get(&a).copied(), entities.get(b).copied())
                else {
                    continue;
                };

                if resolve_pair(&mut state_a, &mut state_b) {
                    trace!(a = %a, b = %b, "Resolved collision");
                    self.index.update_position(a, state_a.position);
                    self.index.update_position(*b, state_b.position);
                    entities.insert(a, state_a);
                    entities.insert(*b, state_b);
                    resolved += 1;
                }
            }
        }
        resolved
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(PhysicsConfig::default())
    }
}

/// Push two overlapping spheres apart and exchange an impulse if they are
/// approaching. Returns false when the pair does not overlap or both are static.
pub fn resolve_pair(a: &mut EntityState, b: &mut EntityState) -> bool {
    let delta = b.position - a.position;
    let min_dist = a.body.radius + b.body.radius;
    let dist_sq = delta.length_squared();
    if dist_sq >= min_dist * min_dist {
        return false;
    }

    let inv_a = a.body.inverse_mass();
    let inv_b = b.body.inverse_mass();
    let inv_sum = inv_a + inv_b;
    if inv_sum <= 0.0 {
        return false;
    }

    let dist = dist_sq.sqrt();
    let normal = if dist > COINCIDENT_EPSILON {
        delta / dist
    } else {
        Vec3::X
    };

    let penetration = min_dist - dist + SEPARATION_SLOP;
    a.position -= normal * (penetration * inv_a / inv_sum);
    b.position += normal * (penetration * inv_b / inv_sum);

    // Negative means the bodies are closing; separating pairs keep their velocity
    let velocity_along_normal = (b.velocity - a.velocity).dot(normal);
    if velocity_along_normal <= 0.0 {
        let restitution = a.body.restitution.min(b.body.restitution);
        let impulse = -(1.0 + restitution) * velocity_along_normal / inv_sum;
        a.velocity -= normal * (impulse * inv_a);
        b.velocity += normal * (impulse * inv_b);
    }

    true
}

/// Keep a sphere inside the world box, reflecting and damping velocity on
/// each axis it touches. Returns true if the sphere had to be moved.
fn clamp_to_bounds(state: &mut EntityState, bounds: &WorldBounds) -> bool {
    let mut moved = false;
    let r = state.body.radius;
    let restitution = state.body.restitution;

    for axis in 0..3 {
        let mut lo = bounds.min[axis] + r;
        let mut hi = bounds.max[axis] - r;
        if lo > hi {
            let mid = (bounds.min[axis] + bounds.max[axis]) * 0.5;
            lo = mid;
            hi = mid;
        }

        let p = state.position[axis];
        if p < lo {
            state.position[axis] = lo;
            moved = true;
            if state.velocity[axis] < 0.0 {
                state.velocity[axis] = -state.velocity[axis] * restitution;
            }
            if axis == 1 && state.velocity.y < REST_SPEED {
                state.velocity.y = 0.0;
            }
        } else if p > hi {
            state.position[axis] = hi;
            moved = true;
            if state.velocity[axis] > 0.0 {
                state.velocity[axis] = -state.velocity[axis] * restitution;
            }
        }
    }

    let floor = bounds.min.y + r;
    state.on_ground = state.position.y <= floor + GROUND_EPSILON;
    moved
}
