//! Predictive state synchronization for real-time multiplayer games
//!
//! - `sim`: the deterministic step function and spatial index, shared by
//!   clients and the authority
//! - `client`: input sequencing, prediction, reconciliation and snapshot
//!   interpolation, tied together by `SyncSession`
//! - `net`: wire protocol, the network pump and an in-process loopback link
//! - `server`: the authoritative host used by the demo and tests

pub mod client;
pub mod config;
pub mod net;
pub mod server;
pub mod sim;
pub mod util;

pub use client::{RenderView, SessionEvent, SyncError, SyncSession};
pub use config::{ConfigError, EngineConfig};
pub use sim::{Command, EntityId, EntityState, Simulator, WorldState};
