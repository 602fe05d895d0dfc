//! Predictive sync demo - authority and two predicting clients in one process
//!
//! The authority and both clients talk over loopback links with configurable
//! latency. Each client predicts its own entity, reconciles against snapshots
//! and interpolates the other one. Input comes from a seeded autopilot.

use std::time::Duration;

use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use predictive_sync::client::{
    InputAction, InputState, RenderView, SessionEvent, SessionHandle, SyncSession,
};
use predictive_sync::config::{DemoConfig, EngineConfig};
use predictive_sync::net::{loopback_pair, spawn_pump, PumpHandle, WireEndpoint};
use predictive_sync::server::AuthorityHost;
use predictive_sync::util::time::{unix_millis_f64, Timer};

const RENDER_FPS: f64 = 144.0;
const STATUS_EVERY_SECS: f64 = 1.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let engine = EngineConfig::from_env()?;
    let demo = DemoConfig::from_env()?;

    // Initialize tracing
    init_tracing(&demo.log_level);

    info!("Starting predictive sync demo");
    info!(
        tick_rate = engine.tick_rate,
        snapshot_rate = demo.snapshot_rate,
        latency_ms = demo.loopback_latency_ms,
        seconds = demo.demo_seconds,
        "Demo settings"
    );

    let mut host = AuthorityHost::new(
        engine.clone(),
        rand::random(),
        demo.snapshot_rate,
        unix_millis_f64(),
    );
    host.add_static(Vec3::new(6.0, 1.5, 0.0), 1.5);
    host.add_static(Vec3::new(-4.0, 1.0, 8.0), 1.0);

    let (connect_tx, connect_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let authority = tokio::spawn(host.run(connect_rx, shutdown_rx));

    let latency = Duration::from_millis(demo.loopback_latency_ms);
    let mut clients = vec![
        DemoClient::connect("player", &engine, &connect_tx, latency, 1).await?,
        DemoClient::connect("bot", &engine, &connect_tx, latency, 2).await?,
    ];

    let mut frame_interval = interval(Duration::from_secs_f64(1.0 / RENDER_FPS));
    frame_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let clock = Timer::new();
    let mut last_frame = 0.0;
    let mut next_status = STATUS_EVERY_SECS;

    let deadline = tokio::time::sleep(Duration::from_secs(demo.demo_seconds));
    tokio::pin!(deadline);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = frame_interval.tick() => {
                let now = clock.elapsed_secs_f64();
                let frame_secs = now - last_frame;
                last_frame = now;

                for client in clients.iter_mut() {
                    client.frame(frame_secs);
                }
                if now >= next_status {
                    next_status += STATUS_EVERY_SECS;
                    for client in &clients {
                        client.report();
                    }
                }
            }
            _ = &mut deadline => {
                info!("Demo time elapsed");
                break;
            }
            _ = &mut shutdown => break,
        }
    }

    for client in clients {
        client.disconnect();
    }
    let _ = shutdown_tx.send(true);
    authority.await?;

    info!("Demo shutdown complete");
    Ok(())
}

/// One simulated player: session, pump and scripted input
struct DemoClient {
    name: &'static str,
    session: SyncSession,
    view: RenderView,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    pump: PumpHandle,
    input: InputState,
    pilot: Autopilot,
}

impl DemoClient {
    async fn connect(
        name: &'static str,
        engine: &EngineConfig,
        authority: &mpsc::Sender<WireEndpoint>,
        latency: Duration,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let (client_wire, server_wire) = loopback_pair(latency);
        authority
            .send(server_wire)
            .await
            .map_err(|_| anyhow::anyhow!("authority is not accepting links"))?;

        let (session, handle) = SyncSession::new(engine.clone(), Uuid::new_v4());
        let SessionHandle { link, view, events } = handle;
        info!(client = name, session_id = %link.session_id, "Client connecting");
        let pump = spawn_pump(client_wire, link);

        Ok(Self {
            name,
            session,
            view,
            events,
            pump,
            input: InputState::new(),
            pilot: Autopilot::new(seed),
        })
    }

    fn frame(&mut self, frame_secs: f64) {
        self.pilot.drive(&mut self.input, frame_secs);
        self.session.advance(frame_secs, &mut self.input);

        while let Ok(event) = self.events.try_recv() {
            match event {
                SessionEvent::Desynced(reason) => {
                    warn!(client = self.name, ?reason, "Client desynced");
                }
                other => info!(client = self.name, event = ?other, "Session event"),
            }
        }
    }

    fn report(&self) {
        let latency = self.pump.latency();
        let server_now = latency.server_now(unix_millis_f64());
        let remotes: Vec<_> = self
            .view
            .remote_entities()
            .into_iter()
            .filter_map(|id| Some((id, self.view.remote_render_state(id, server_now)?.position)))
            .collect();
        let stats = self.session.reconcile_stats();

        info!(
            client = self.name,
            position = ?self.view.local_render_state().map(|s| s.position),
            pending = self.session.pending_commands(),
            rtt_ms = ?latency.rtt_ms,
            corrections = stats.corrections,
            max_correction = stats.max_correction,
            remotes = ?remotes,
            "Client status"
        );
    }

    fn disconnect(mut self) {
        self.session.leave();
        self.pump.shutdown();
    }
}

/// Seeded random walk over the movement bindings
struct Autopilot {
    rng: ChaCha8Rng,
    hold_secs: f64,
}

impl Autopilot {
    fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            hold_secs: 0.0,
        }
    }

    fn drive(&mut self, input: &mut InputState, frame_secs: f64) {
        self.hold_secs -= frame_secs;
        if self.hold_secs > 0.0 {
            input.set_action(InputAction::Jump, false);
            return;
        }
        self.hold_secs = self.rng.gen_range(0.4..1.6);

        let strafe = self.rng.gen_range(0..3);
        input.set_action(InputAction::MoveForward, self.rng.gen_bool(0.7));
        input.set_action(InputAction::MoveBackward, false);
        input.set_action(InputAction::MoveLeft, strafe == 1);
        input.set_action(InputAction::MoveRight, strafe == 2);
        input.set_action(InputAction::Sprint, self.rng.gen_bool(0.3));
        input.set_action(InputAction::Jump, self.rng.gen_bool(0.25));
        input.mouse_moved(self.rng.gen_range(-150.0..150.0), 0.0);
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Ctrl+C or SIGTERM; a handler that cannot be installed never fires
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
