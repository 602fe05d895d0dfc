//! Rate limiting utilities

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Rate limiter type alias
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Create a rate limiter with the specified requests per second
pub fn create_limiter(requests_per_second: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

/// Headroom over the tick rate for bursts after a network hiccup
pub const COMMAND_BURST_FACTOR: u32 = 2;

/// Per-client inbound frame limiter used by the authority
#[derive(Clone)]
pub struct ClientRateLimiter {
    frame_limiter: Arc<Limiter>,
}

impl ClientRateLimiter {
    /// Allows `tick_rate * COMMAND_BURST_FACTOR` frames per second
    pub fn for_tick_rate(tick_rate: u32) -> Self {
        Self {
            frame_limiter: create_limiter(tick_rate.saturating_mul(COMMAND_BURST_FACTOR)),
        }
    }

    /// Check if an inbound frame is allowed (returns true if allowed)
    pub fn check_frame(&self) -> bool {
        self.frame_limiter.check().is_ok()
    }
}
