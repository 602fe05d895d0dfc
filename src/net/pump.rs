//! Network pump: bridges a text-frame transport and a sync session

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::session::{Inbound, SessionLink};
use crate::util::time::unix_millis_f64;

use super::protocol::{ClientMsg, ConnectionEvent, ServerMsg};
use super::WireEndpoint;

/// How often clock-sync pings are sent
pub const PING_INTERVAL: Duration = Duration::from_millis(1000);
/// Weight of a new RTT sample in the moving average
const RTT_SMOOTHING: f64 = 0.1;

/// Round-trip and clock offset estimates from ping/pong
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    /// Smoothed round-trip time in ms, `None` before the first pong
    pub rtt_ms: Option<f64>,
    /// Add to local wall-clock ms to get authority time
    pub clock_offset_ms: f64,
    pub samples: u64,
}

impl LatencyStats {
    /// Fold in one pong received at local time `now`
    pub fn record(&mut self, client_time: f64, server_time: f64, now: f64) {
        let sample = (now - client_time).max(0.0);
        let rtt = match self.rtt_ms {
            Some(prev) => prev + RTT_SMOOTHING * (sample - prev),
            None => sample,
        };
        self.rtt_ms = Some(rtt);
        self.clock_offset_ms = server_time + rtt / 2.0 - now;
        self.samples += 1;
    }

    /// Local wall-clock ms mapped onto the authority clock
    pub fn server_now(&self, now: f64) -> f64 {
        now + self.clock_offset_ms
    }
}

/// Running pump task
#[derive(Debug)]
pub struct PumpHandle {
    task: JoinHandle<()>,
    latency: Arc<Mutex<LatencyStats>>,
}

impl PumpHandle {
    pub fn latency(&self) -> LatencyStats {
        *self.latency.lock()
    }

    /// Authority time right now, per the latest clock estimate
    pub fn server_now(&self) -> f64 {
        self.latency().server_now(unix_millis_f64())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop pumping; the transport is dropped with the task
    pub fn shutdown(self) {
        self.task.abort();
    }
}

/// Spawn the pump for one session over `wire`
pub fn spawn_pump(wire: WireEndpoint, link: SessionLink) -> PumpHandle {
    let latency = Arc::new(Mutex::new(LatencyStats::default()));
    let task = tokio::spawn(run_pump(wire, link, Arc::clone(&latency)));
    PumpHandle { task, latency }
}

async fn run_pump(wire: WireEndpoint, link: SessionLink, latency: Arc<Mutex<LatencyStats>>) {
    let WireEndpoint {
        mut incoming,
        outgoing,
    } = wire;
    let SessionLink {
        session_id,
        mut commands,
        inbound,
    } = link;

    if send_msg(&outgoing, &ClientMsg::Hello { session_id }).await.is_err() {
        let _ = inbound
            .send(Inbound::Connection(ConnectionEvent::Disconnected))
            .await;
        return;
    }
    if inbound
        .send(Inbound::Connection(ConnectionEvent::Connected))
        .await
        .is_err()
    {
        return;
    }
    info!(session_id = %session_id, "Pump started");

    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            frame = incoming.recv() => match frame {
                Some(text) => {
                    if !forward_frame(&text, &inbound, &latency).await {
                        debug!(session_id = %session_id, "Session gone, stopping pump");
                        break;
                    }
                }
                None => {
                    info!(session_id = %session_id, "Link closed");
                    let _ = inbound.send(Inbound::Connection(ConnectionEvent::Disconnected)).await;
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(command) => {
                    if send_msg(&outgoing, &ClientMsg::Command { command }).await.is_err() {
                        let _ = inbound.send(Inbound::Connection(ConnectionEvent::Disconnected)).await;
                        break;
                    }
                }
                None => {
                    let _ = send_msg(&outgoing, &ClientMsg::Leave).await;
                    break;
                }
            },
            _ = ping.tick() => {
                let ping_msg = ClientMsg::Ping { client_time: unix_millis_f64() };
                if send_msg(&outgoing, &ping_msg).await.is_err() {
                    let _ = inbound.send(Inbound::Connection(ConnectionEvent::Disconnected)).await;
                    break;
                }
            }
        }
    }
}

/// Decode one frame and hand it on. Returns false once the session is gone.
async fn forward_frame(text: &str, inbound: &mpsc::Sender<Inbound>, latency: &Mutex<LatencyStats>) -> bool {
    let msg = match ServerMsg::decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Dropping malformed server frame");
            return true;
        }
    };

    let forwarded = match msg {
        ServerMsg::Welcome {
            session_id,
            entity_id,
            server_time,
            tick_rate,
        } => {
            {
                let mut stats = latency.lock();
                if stats.samples == 0 {
                    stats.clock_offset_ms = server_time - unix_millis_f64();
                }
            }
            debug!(tick_rate, "Authority tick rate");
            Inbound::Welcome {
                session_id,
                entity_id,
                server_time,
            }
        }
        ServerMsg::Snapshot(snapshot) => Inbound::Snapshot(snapshot),
        ServerMsg::EntityRemoved { entity_id } => Inbound::EntityRemoved(entity_id),
        ServerMsg::Pong {
            client_time,
            server_time,
        } => {
            latency.lock().record(client_time, server_time, unix_millis_f64());
            return true;
        }
        ServerMsg::Error { code, message } => {
            warn!(code = %code, message = %message, "Authority reported error");
            return true;
        }
    };

    inbound.send(forwarded).await.is_ok()
}

async fn send_msg(sink: &mpsc::Sender<String>, msg: &ClientMsg) -> Result<(), String> {
    let json = msg.encode().map_err(|e| e.to_string())?;
    sink.send(json).await.map_err(|e| e.to_string())
}
