//! Configuration module - environment variable parsing

use std::env;
use std::str::FromStr;

use glam::Vec3;

/// Axis-aligned box every simulated entity is kept inside
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl WorldBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            min: Vec3::new(-1000.0, 0.0, -1000.0),
            max: Vec3::new(1000.0, 500.0, 1000.0),
        }
    }
}

/// Engine configuration shared by the client session and the authority.
///
/// Both sides must run with identical simulation settings (`tick_rate`,
/// `gravity`, `linear_damping`, `world_bounds`, `cell_size`), otherwise every
/// reconciliation turns into a correction.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Fixed simulation rate in ticks per second
    pub tick_rate: u32,
    /// How far in the past remote entities are rendered
    pub interpolation_delay_ms: f64,
    /// Hard cap on unacknowledged commands before a desync is raised
    pub max_pending_commands: usize,
    /// History kept per remote entity
    pub snapshot_buffer_window_ms: f64,
    pub world_bounds: WorldBounds,
    /// Vertical acceleration in units/s²
    pub gravity: f32,
    /// Spatial grid cell edge length
    pub cell_size: f32,
    /// Silence after which the session reports a desync
    pub snapshot_timeout_ms: f64,
    /// Upper bound on fixed steps run per render frame
    pub max_sub_steps: u32,
    /// Horizontal velocity multiplier applied every tick
    pub linear_damping: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            interpolation_delay_ms: 100.0,
            max_pending_commands: 300,
            snapshot_buffer_window_ms: 1000.0,
            world_bounds: WorldBounds::default(),
            gravity: -9.81,
            cell_size: 50.0,
            snapshot_timeout_ms: 1000.0,
            max_sub_steps: 3,
            linear_damping: 0.99,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            tick_rate: parse_var("TICK_RATE", defaults.tick_rate)?,
            interpolation_delay_ms: parse_var(
                "INTERPOLATION_DELAY_MS",
                defaults.interpolation_delay_ms,
            )?,
            max_pending_commands: parse_var("MAX_PENDING_COMMANDS", defaults.max_pending_commands)?,
            snapshot_buffer_window_ms: parse_var(
                "SNAPSHOT_BUFFER_WINDOW_MS",
                defaults.snapshot_buffer_window_ms,
            )?,
            world_bounds: WorldBounds {
                min: parse_vec3_var("WORLD_MIN", defaults.world_bounds.min)?,
                max: parse_vec3_var("WORLD_MAX", defaults.world_bounds.max)?,
            },
            gravity: parse_var("GRAVITY", defaults.gravity)?,
            cell_size: parse_var("CELL_SIZE", defaults.cell_size)?,
            snapshot_timeout_ms: parse_var("SNAPSHOT_TIMEOUT_MS", defaults.snapshot_timeout_ms)?,
            max_sub_steps: parse_var("MAX_SUB_STEPS", defaults.max_sub_steps)?,
            linear_damping: parse_var("LINEAR_DAMPING", defaults.linear_damping)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the simulation cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::OutOfRange("TICK_RATE"));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(ConfigError::OutOfRange("CELL_SIZE"));
        }
        if !self.gravity.is_finite() {
            return Err(ConfigError::OutOfRange("GRAVITY"));
        }
        if !(0.0..=1.0).contains(&self.linear_damping) {
            return Err(ConfigError::OutOfRange("LINEAR_DAMPING"));
        }
        if self.max_pending_commands == 0 {
            return Err(ConfigError::OutOfRange("MAX_PENDING_COMMANDS"));
        }
        if !(self.interpolation_delay_ms.is_finite() && self.interpolation_delay_ms >= 0.0) {
            return Err(ConfigError::OutOfRange("INTERPOLATION_DELAY_MS"));
        }
        if !(self.snapshot_buffer_window_ms.is_finite() && self.snapshot_buffer_window_ms > 0.0) {
            return Err(ConfigError::OutOfRange("SNAPSHOT_BUFFER_WINDOW_MS"));
        }
        if !(self.snapshot_timeout_ms.is_finite() && self.snapshot_timeout_ms > 0.0) {
            return Err(ConfigError::OutOfRange("SNAPSHOT_TIMEOUT_MS"));
        }
        let bounds = self.world_bounds;
        if !bounds.min.is_finite() || !bounds.max.is_finite() || bounds.min.cmpge(bounds.max).any()
        {
            return Err(ConfigError::InvalidBounds);
        }
        Ok(())
    }

    /// Fixed simulation step in seconds
    pub fn dt(&self) -> f32 {
        crate::util::time::tick_delta(self.tick_rate)
    }
}

/// Settings for the loopback demo binary
#[derive(Clone, Debug)]
pub struct DemoConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Authority snapshot broadcasts per second
    pub snapshot_rate: u32,
    /// One-way latency added by the loopback link
    pub loopback_latency_ms: u64,
    /// How long the demo match runs
    pub demo_seconds: u64,
}

impl DemoConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            snapshot_rate: parse_var("SNAPSHOT_RATE", 20)?,
            loopback_latency_ms: parse_var("LOOPBACK_LATENCY_MS", 60)?,
            demo_seconds: parse_var("DEMO_SECONDS", 10)?,
        };
        if config.snapshot_rate == 0 {
            return Err(ConfigError::OutOfRange("SNAPSHOT_RATE"));
        }
        Ok(config)
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

fn parse_vec3_var(key: &'static str, default: Vec3) -> Result<Vec3, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_vec3(&raw).ok_or(ConfigError::Invalid { key, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Parse `"x,y,z"` into a vector
pub fn parse_vec3(raw: &str) -> Option<Vec3> {
    let parts: Vec<f32> = raw
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [x, y, z] => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("Setting out of range: {0}")]
    OutOfRange(&'static str),

    #[error("World bounds must have min < max on every axis")]
    InvalidBounds,
}
