//! Client-side prediction of the local entity

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::sim::{Command, EntityId, EntityState, PhysicsConfig, Simulator, WorldState};

use super::SyncError;

/// Lifecycle of the predictor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorState {
    /// No authoritative base yet; commands are queued but not simulated
    Idle,
    /// Simulating ahead of the last authoritative state
    Predicting,
}

/// Runs the shared step function on the local entity ahead of the authority
/// and keeps every command the authority has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct Predictor {
    entity_id: EntityId,
    simulator: Simulator,
    dt: f32,
    state: PredictorState,
    world: WorldState,
    pending: VecDeque<Command>,
    max_pending: usize,
}

impl Predictor {
    pub fn new(entity_id: EntityId, simulator: Simulator, dt: f32, max_pending: usize) -> Self {
        Self {
            entity_id,
            simulator,
            dt,
            state: PredictorState::Idle,
            world: WorldState::new(),
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn from_config(entity_id: EntityId, config: &EngineConfig) -> Self {
        Self::new(
            entity_id,
            Simulator::new(PhysicsConfig::from(config)),
            config.dt(),
            config.max_pending_commands,
        )
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn state(&self) -> PredictorState {
        self.state
    }

    /// Apply a freshly captured command on top of the current prediction.
    ///
    /// Fails without side effects when the pending queue is at capacity or the
    /// command does not advance the sequence.
    pub fn apply(&mut self, command: Command) -> Result<(), SyncError> {
        if self.pending.len() >= self.max_pending {
            return Err(SyncError::PendingOverflow {
                pending: self.pending.len(),
                cap: self.max_pending,
            });
        }
        if let Some(last) = self.pending.back() {
            if command.sequence <= last.sequence {
                return Err(SyncError::OutOfOrder {
                    sequence: command.sequence,
                    last: last.sequence,
                });
            }
        }

        if self.state == PredictorState::Predicting {
            self.world = self
                .simulator
                .step_entity(&self.world, self.entity_id, &command, self.dt);
        }
        self.pending.push_back(command);
        trace!(sequence = command.sequence, pending = self.pending.len(), "Predicted command");
        Ok(())
    }

    /// Predicted local entity, `None` until the first authoritative base arrives
    pub fn predicted_state(&self) -> Option<&EntityState> {
        match self.state {
            PredictorState::Idle => None,
            PredictorState::Predicting => self.world.get(self.entity_id),
        }
    }

    /// World the prediction runs in (local entity plus static scenery)
    pub fn predicted_world(&self) -> &WorldState {
        &self.world
    }

    pub fn pending(&self) -> impl Iterator<Item = &Command> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_pending
    }

    /// Drop commands the authority has processed (sequence <= `ack`)
    pub(crate) fn drop_acknowledged(&mut self, ack: u64) -> usize {
        let before = self.pending.len();
        while self.pending.front().is_some_and(|c| c.sequence <= ack) {
            self.pending.pop_front();
        }
        before - self.pending.len()
    }

    /// Reset to `base` and re-simulate every remaining pending command in order
    pub(crate) fn replay_from(&mut self, base: WorldState) -> usize {
        if self.state == PredictorState::Idle {
            debug!(entity_id = %self.entity_id, "Prediction started from authoritative state");
        }
        self.state = PredictorState::Predicting;
        self.world = base;
        for command in &self.pending {
            self.world = self
                .simulator
                .step_entity(&self.world, self.entity_id, command, self.dt);
        }
        self.pending.len()
    }

    /// Forget all prediction state and pending commands
    pub fn reset(&mut self) {
        self.state = PredictorState::Idle;
        self.world = WorldState::new();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::sim::{BodyProfile, MovementFlags};

    fn forward(seq: u64) -> Command {
        Command::new(seq, seq as f64).with_movement(MovementFlags {
            forward: true,
            ..Default::default()
        })
    }

    fn base(id: EntityId) -> WorldState {
        WorldState::from_entities(
            0,
            [(id, EntityState::new(Vec3::new(0.0, 0.5, 0.0), BodyProfile::player()))],
        )
    }

    #[test]
    fn test_idle_queues_without_simulating() {
        let id = EntityId(1);
        let mut predictor = Predictor::from_config(id, &EngineConfig::default());
        predictor.apply(forward(1)).unwrap();
        assert_eq!(predictor.state(), PredictorState::Idle);
        assert!(predictor.predicted_state().is_none());
        assert_eq!(predictor.pending_len(), 1);
    }

    #[test]
    fn test_predicting_moves_local_entity() {
        let id = EntityId(1);
        let mut predictor = Predictor::from_config(id, &EngineConfig::default());
        predictor.replay_from(base(id));
        predictor.apply(forward(1)).unwrap();
        let z = predictor.predicted_state().map(|s| s.position.z).unwrap();
        assert!(z < 0.0);
    }

    #[test]
    fn test_overflow_rejects_command() {
        let id = EntityId(1);
        let sim = Simulator::default();
        let mut predictor = Predictor::new(id, sim, 1.0 / 60.0, 3);
        for seq in 1..=3 {
            predictor.apply(forward(seq)).unwrap();
        }
        assert_eq!(
            predictor.apply(forward(4)),
            Err(SyncError::PendingOverflow { pending: 3, cap: 3 })
        );
        assert_eq!(predictor.pending_len(), 3);
        assert!(predictor.is_full());
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut predictor = Predictor::from_config(EntityId(1), &EngineConfig::default());
        predictor.apply(forward(5)).unwrap();
        assert!(matches!(
            predictor.apply(forward(5)),
            Err(SyncError::OutOfOrder { sequence: 5, last: 5 })
        ));
    }

    #[test]
    fn test_drop_acknowledged_keeps_newer() {
        let mut predictor = Predictor::from_config(EntityId(1), &EngineConfig::default());
        for seq in 1..=10 {
            predictor.apply(forward(seq)).unwrap();
        }
        assert_eq!(predictor.drop_acknowledged(7), 7);
        let left: Vec<u64> = predictor.pending().map(|c| c.sequence).collect();
        assert_eq!(left, vec![8, 9, 10]);
        assert_eq!(predictor.drop_acknowledged(7), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let id = EntityId(1);
        let mut predictor = Predictor::from_config(id, &EngineConfig::default());
        predictor.replay_from(base(id));
        predictor.apply(forward(1)).unwrap();
        predictor.reset();
        assert_eq!(predictor.state(), PredictorState::Idle);
        assert_eq!(predictor.pending_len(), 0);
        assert!(predictor.predicted_world().is_empty());
    }
}
