//! Time utilities for the fixed-timestep simulation

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Current Unix time in fractional milliseconds, the unit used for
/// `Command::timestamp` and `Snapshot::server_time`
pub fn unix_millis_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
        * 1000.0
}

/// Calculate delta time for a tick rate (in seconds)
pub fn tick_delta(tick_rate: u32) -> f32 {
    1.0 / tick_rate.max(1) as f32
}

/// Accumulates variable render-frame time and hands out fixed simulation steps.
///
/// At most `max_sub_steps` steps are released per frame; anything beyond that is
/// dropped so a long stall cannot trigger a catch-up spiral.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    step: f64,
    max_sub_steps: u32,
    accumulator: f64,
    dropped_time: f64,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32, max_sub_steps: u32) -> Self {
        Self {
            step: 1.0 / tick_rate.max(1) as f64,
            max_sub_steps: max_sub_steps.max(1),
            accumulator: 0.0,
            dropped_time: 0.0,
        }
    }

    /// Feed one frame's elapsed seconds, returns how many fixed steps to run
    pub fn advance(&mut self, frame_secs: f64) -> u32 {
        if frame_secs.is_finite() && frame_secs > 0.0 {
            self.accumulator += frame_secs;
        }

        let mut steps = 0;
        while self.accumulator >= self.step && steps < self.max_sub_steps {
            self.accumulator -= self.step;
            steps += 1;
        }

        if self.accumulator >= self.step {
            let excess = self.accumulator - self.accumulator % self.step;
            self.dropped_time += excess;
            self.accumulator -= excess;
            debug!(dropped_secs = excess, "Simulation fell behind, dropping accumulated time");
        }

        steps
    }

    /// Fraction of a step left in the accumulator (0..1), for render blending
    pub fn alpha(&self) -> f64 {
        self.accumulator / self.step
    }

    /// Total seconds discarded because of the sub-step cap
    pub fn dropped_secs(&self) -> f64 {
        self.dropped_time
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn elapsed_secs_f64(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
