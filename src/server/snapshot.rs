//! Snapshot scheduling and building

use crate::net::protocol::Snapshot;
use crate::sim::WorldState;

/// Decides which ticks produce a snapshot and builds per-client snapshots
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    /// Ticks since the last snapshot
    ticks_since_snapshot: u32,
    /// Snapshot interval in ticks
    snapshot_interval: u32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            ticks_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Interval for `snapshot_rate` snapshots per second at `tick_rate`
    pub fn for_rates(tick_rate: u32, snapshot_rate: u32) -> Self {
        Self::new(tick_rate / snapshot_rate.max(1))
    }

    pub fn interval(&self) -> u32 {
        self.snapshot_interval
    }

    /// Count one tick; true when it is time to send
    pub fn should_send(&mut self) -> bool {
        self.ticks_since_snapshot += 1;
        if self.ticks_since_snapshot >= self.snapshot_interval {
            self.ticks_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Send on the next tick regardless of the interval (joins, removals)
    pub fn force_next(&mut self) {
        self.ticks_since_snapshot = self.snapshot_interval;
    }

    /// Full-world snapshot carrying one client's acknowledgement
    pub fn build(&self, world: &WorldState, server_time: f64, last_processed_input: Option<u64>) -> Snapshot {
        Snapshot::new(server_time, world.tick(), last_processed_input, world)
    }
}

/// Outbound snapshot traffic, logged periodically by the authority
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotStats {
    pub total_snapshots: u64,
    pub total_bytes: u64,
    pub avg_entities_per_snapshot: f32,
}

impl SnapshotStats {
    pub fn record(&mut self, entity_count: usize, bytes: usize) {
        self.total_snapshots += 1;
        self.total_bytes += bytes as u64;

        // Running average
        let n = self.total_snapshots as f32;
        self.avg_entities_per_snapshot =
            self.avg_entities_per_snapshot * ((n - 1.0) / n) + (entity_count as f32 / n);
    }
}
