//! In-process transport with configurable one-way latency

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use super::WireEndpoint;

/// Frames buffered per direction
const LINK_CAPACITY: usize = 1024;

/// Connected (client, server) endpoints. Every frame arrives `latency` after
/// it was sent, in send order.
pub fn loopback_pair(latency: Duration) -> (WireEndpoint, WireEndpoint) {
    let (client_out_tx, client_out_rx) = mpsc::channel(LINK_CAPACITY);
    let (server_in_tx, server_in_rx) = mpsc::channel(LINK_CAPACITY);
    let (server_out_tx, server_out_rx) = mpsc::channel(LINK_CAPACITY);
    let (client_in_tx, client_in_rx) = mpsc::channel(LINK_CAPACITY);

    spawn_delayed(client_out_rx, server_in_tx, latency);
    spawn_delayed(server_out_rx, client_in_tx, latency);

    let client = WireEndpoint {
        incoming: client_in_rx,
        outgoing: client_out_tx,
    };
    let server = WireEndpoint {
        incoming: server_in_rx,
        outgoing: server_out_tx,
    };
    (client, server)
}

/// Forward `rx` into `tx` with a fixed delay. Stamping and delivery run in
/// separate tasks so a frame waiting out its delay does not hold back the
/// stamping of the next one.
fn spawn_delayed(mut rx: mpsc::Receiver<String>, tx: mpsc::Sender<String>, latency: Duration) {
    let (stamped_tx, mut stamped_rx) = mpsc::unbounded_channel::<(Instant, String)>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if stamped_tx.send((Instant::now() + latency, frame)).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some((due, frame)) = stamped_rx.recv().await {
            sleep_until(due).await;
            if tx.send(frame).await.is_err() {
                trace!("Loopback peer dropped");
                break;
            }
        }
    });
}
