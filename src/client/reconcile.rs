//! Snapshot reconciliation: rebase prediction on authoritative state

use tracing::{debug, trace};

use crate::net::protocol::Snapshot;
use crate::sim::WorldState;

use super::predictor::Predictor;

/// Corrections smaller than this are float noise and not logged
const CORRECTION_LOG_THRESHOLD: f32 = 0.01;

/// Outcome of one applied snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileReport {
    pub server_time: f64,
    pub acknowledged: Option<u64>,
    /// Pending commands discarded as acknowledged
    pub dropped: usize,
    /// Pending commands re-simulated on top of the snapshot
    pub replayed: usize,
    /// Distance the predicted local position moved, 0 on the first snapshot
    pub correction: f32,
}

/// Running totals since the session started
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReconcileStats {
    pub applied: u64,
    pub stale: u64,
    pub corrections: u64,
    pub max_correction: f32,
}

/// Applies authoritative snapshots to a [`Predictor`] in server-time order
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    newest_server_time: Option<f64>,
    stats: ReconcileStats,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn newest_server_time(&self) -> Option<f64> {
        self.newest_server_time
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Rebase `predictor` on `snapshot` and replay what is still pending.
    ///
    /// Returns `None` when the snapshot is not newer than the last applied one
    /// or does not contain the local entity; the predictor is left untouched.
    pub fn reconcile(&mut self, predictor: &mut Predictor, snapshot: &Snapshot) -> Option<ReconcileReport> {
        if self
            .newest_server_time
            .is_some_and(|newest| snapshot.server_time <= newest)
        {
            self.stats.stale += 1;
            trace!(server_time = snapshot.server_time, "Discarding stale snapshot");
            return None;
        }

        let entity_id = predictor.entity_id();
        let Some(authoritative) = snapshot.entity(entity_id) else {
            debug!(entity_id = %entity_id, tick = snapshot.tick, "Snapshot has no local entity");
            return None;
        };
        self.newest_server_time = Some(snapshot.server_time);

        let before = predictor.predicted_state().map(|s| s.position);

        let dropped = snapshot
            .last_processed_input
            .map_or(0, |ack| predictor.drop_acknowledged(ack));

        // Remote entities stay out of the prediction; scenery stays in so
        // local collisions match the authority
        let base = WorldState::from_entities(
            snapshot.tick,
            snapshot
                .entities
                .iter()
                .filter(|e| e.id != entity_id && e.state.body.is_static)
                .map(|e| (e.id, e.state))
                .chain(std::iter::once((entity_id, *authoritative))),
        );
        let replayed = predictor.replay_from(base);

        let after = predictor.predicted_state().map(|s| s.position);
        let correction = match (before, after) {
            (Some(a), Some(b)) => a.distance(b),
            _ => 0.0,
        };

        self.stats.applied += 1;
        if correction > CORRECTION_LOG_THRESHOLD {
            self.stats.corrections += 1;
            self.stats.max_correction = self.stats.max_correction.max(correction);
            debug!(
                entity_id = %entity_id,
                ack = ?snapshot.last_processed_input,
                correction,
                replayed,
                "Prediction corrected"
            );
        }

        Some(ReconcileReport {
            server_time: snapshot.server_time,
            acknowledged: snapshot.last_processed_input,
            dropped,
            replayed,
            correction,
        })
    }

    /// Forget ordering state (new session)
    pub fn reset(&mut self) {
        self.newest_server_time = None;
    }
}
