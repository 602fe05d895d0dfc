//! Networking: wire protocol, the client-side pump and an in-process link

pub mod loopback;
pub mod protocol;
pub mod pump;

use tokio::sync::mpsc;

pub use loopback::loopback_pair;
pub use protocol::{ClientMsg, ConnectionEvent, EntitySnapshot, ProtocolError, ServerMsg, Snapshot};
pub use pump::{spawn_pump, LatencyStats, PumpHandle};

/// One side of a bidirectional text-frame transport.
///
/// The incoming channel closing means the peer is gone.
#[derive(Debug)]
pub struct WireEndpoint {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::Sender<String>,
}
