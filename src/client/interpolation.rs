//! Per-entity snapshot history for rendering remote entities in the past

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::trace;

use crate::config::EngineConfig;
use crate::net::protocol::Snapshot;
use crate::sim::{EntityId, EntityState, Rotation};
use crate::util::math::{lerp, lerp_angle};

/// Hard cap on samples per entity regardless of the time window
const MAX_SAMPLES_PER_ENTITY: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Sample {
    server_time: f64,
    state: EntityState,
}

/// Result of a buffer query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedState {
    pub state: EntityState,
    /// Blend factor between the bracketing samples (0 = older, 1 = newer)
    pub alpha: f32,
    /// Server time that was rendered (query timestamp minus delay)
    pub render_time: f64,
}

/// Time-ordered authoritative samples per remote entity.
///
/// Written by the network side, read by the render side; both only need
/// `&self`.
#[derive(Debug)]
pub struct SnapshotBuffer {
    histories: DashMap<EntityId, VecDeque<Sample>>,
    interpolation_delay_ms: f64,
    window_ms: f64,
}

impl SnapshotBuffer {
    pub fn new(interpolation_delay_ms: f64, window_ms: f64) -> Self {
        Self {
            histories: DashMap::new(),
            interpolation_delay_ms: interpolation_delay_ms.max(0.0),
            window_ms: window_ms.max(0.0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.interpolation_delay_ms, config.snapshot_buffer_window_ms)
    }

    pub fn interpolation_delay_ms(&self) -> f64 {
        self.interpolation_delay_ms
    }

    /// Record one sample. Returns false when it was not newer than the newest
    /// sample already held for that entity.
    pub fn push(&self, id: EntityId, server_time: f64, state: EntityState) -> bool {
        if !server_time.is_finite() {
            return false;
        }
        let mut history = self.histories.entry(id).or_default();
        if history.back().is_some_and(|newest| server_time <= newest.server_time) {
            trace!(entity_id = %id, server_time, "Out-of-order sample discarded");
            return false;
        }
        history.push_back(Sample { server_time, state });

        let horizon = server_time - self.window_ms;
        while history.len() > 1
            && (history.len() > MAX_SAMPLES_PER_ENTITY
                || history.front().is_some_and(|s| s.server_time < horizon))
        {
            history.pop_front();
        }
        true
    }

    /// Record every entity in `snapshot` except `skip` (the predicted local
    /// entity). Returns how many samples were accepted.
    pub fn ingest(&self, snapshot: &Snapshot, skip: Option<EntityId>) -> usize {
        snapshot
            .entities
            .iter()
            .filter(|e| Some(e.id) != skip)
            .filter(|e| self.push(e.id, snapshot.server_time, e.state))
            .count()
    }

    /// Interpolated state of `id` as of `render_timestamp - interpolation_delay`.
    ///
    /// Clamps to the oldest or newest sample outside the buffered range; never
    /// extrapolates.
    pub fn sample(&self, id: EntityId, render_timestamp: f64) -> Option<InterpolatedState> {
        let history = self.histories.get(&id)?;
        let render_time = render_timestamp - self.interpolation_delay_ms;
        let oldest = history.front()?;
        let newest = history.back()?;

        let clamped = |sample: &Sample, alpha| InterpolatedState {
            state: sample.state,
            alpha,
            render_time,
        };

        if history.len() == 1 || render_time >= newest.server_time {
            return Some(clamped(newest, 1.0));
        }
        if render_time.is_nan() || render_time <= oldest.server_time {
            return Some(clamped(oldest, 0.0));
        }

        // First sample strictly after render_time; index >= 1 given the checks above
        let next_idx = history.partition_point(|s| s.server_time <= render_time);
        let (prev, next) = (&history[next_idx - 1], &history[next_idx]);
        let span = next.server_time - prev.server_time;
        let alpha = ((render_time - prev.server_time) / span).clamp(0.0, 1.0) as f32;

        Some(InterpolatedState {
            state: blend(&prev.state, &next.state, alpha),
            alpha,
            render_time,
        })
    }

    pub fn query(&self, id: EntityId, render_timestamp: f64) -> Option<EntityState> {
        self.sample(id, render_timestamp).map(|s| s.state)
    }

    pub fn remove(&self, id: EntityId) -> bool {
        self.histories.remove(&id).is_some()
    }

    pub fn clear(&self) {
        self.histories.clear();
    }

    /// Buffered entity ids in ascending order
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.histories.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn sample_count(&self, id: EntityId) -> usize {
        self.histories.get(&id).map_or(0, |h| h.len())
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }
}

fn blend(from: &EntityState, to: &EntityState, alpha: f32) -> EntityState {
    EntityState {
        position: from.position.lerp(to.position, alpha),
        velocity: from.velocity.lerp(to.velocity, alpha),
        rotation: Rotation {
            yaw: lerp_angle(from.rotation.yaw, to.rotation.yaw, alpha),
            pitch: lerp_angle(from.rotation.pitch, to.rotation.pitch, alpha),
        },
        health: lerp(from.health, to.health, alpha),
        on_ground: to.on_ground,
        body: to.body,
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use glam::Vec3;

    use super::*;
    use crate::sim::BodyProfile;

    fn at(x: f32) -> EntityState {
        EntityState::new(Vec3::new(x, 0.0, 0.0), BodyProfile::player())
    }

    #[test]
    fn test_midpoint_interpolation() {
        let buffer = SnapshotBuffer::new(100.0, 1000.0);
        buffer.push(EntityId(1), 1000.0, at(0.0));
        buffer.push(EntityId(1), 1050.0, at(10.0));

        let result = buffer.sample(EntityId(1), 1125.0).unwrap();
        assert!((result.alpha - 0.5).abs() < 1e-6);
        assert!((result.state.position.x - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_clamps_without_extrapolating() {
        let buffer = SnapshotBuffer::new(100.0, 1000.0);
        buffer.push(EntityId(1), 1000.0, at(0.0));
        buffer.push(EntityId(1), 1050.0, at(10.0));

        assert_eq!(buffer.query(EntityId(1), 5000.0).map(|s| s.position.x), Some(10.0));
        assert_eq!(buffer.query(EntityId(1), 0.0).map(|s| s.position.x), Some(0.0));
    }

    #[test]
    fn test_single_sample_returned_unmodified() {
        let buffer = SnapshotBuffer::new(100.0, 1000.0);
        buffer.push(EntityId(4), 500.0, at(3.0));
        assert_eq!(buffer.query(EntityId(4), 0.0), Some(at(3.0)));
        assert!(buffer.query(EntityId(5), 0.0).is_none());
    }

    #[test]
    fn test_out_of_order_sample_discarded() {
        let buffer = SnapshotBuffer::new(0.0, 1000.0);
        assert!(buffer.push(EntityId(1), 100.0, at(0.0)));
        assert!(buffer.push(EntityId(1), 200.0, at(10.0)));
        assert!(!buffer.push(EntityId(1), 150.0, at(99.0)));
        assert!(!buffer.push(EntityId(1), 200.0, at(99.0)));
        assert_eq!(buffer.sample_count(EntityId(1)), 2);
        assert!((buffer.query(EntityId(1), 150.0).unwrap().position.x - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_window_evicts_old_samples() {
        let buffer = SnapshotBuffer::new(100.0, 1000.0);
        for i in 0..30 {
            buffer.push(EntityId(1), i as f64 * 100.0, at(i as f32));
        }
        // Newest is 2900, so everything before 1900 is gone
        assert_eq!(buffer.sample_count(EntityId(1)), 11);
        assert_eq!(buffer.query(EntityId(1), 0.0).map(|s| s.position.x), Some(19.0));
    }

    #[test]
    fn test_rotation_takes_short_path() {
        let buffer = SnapshotBuffer::new(0.0, 1000.0);
        let mut a = at(0.0);
        a.rotation.yaw = PI - 0.1;
        let mut b = at(0.0);
        b.rotation.yaw = -PI + 0.1;
        buffer.push(EntityId(1), 0.0, a);
        buffer.push(EntityId(1), 100.0, b);

        let yaw = buffer.query(EntityId(1), 50.0).unwrap().rotation.yaw;
        assert!(yaw.abs() > PI - 0.01, "yaw {yaw} went the long way round");
    }

    #[test]
    fn test_ingest_skips_local_entity() {
        use crate::sim::WorldState;

        let world = WorldState::from_entities(1, [(EntityId(1), at(0.0)), (EntityId(2), at(5.0))]);
        let snapshot = Snapshot::new(100.0, 1, None, &world);
        let buffer = SnapshotBuffer::new(100.0, 1000.0);
        assert_eq!(buffer.ingest(&snapshot, Some(EntityId(1))), 1);
        assert_eq!(buffer.entity_ids(), vec![EntityId(2)]);
        assert!(buffer.remove(EntityId(2)));
        assert!(buffer.is_empty());
    }
}
