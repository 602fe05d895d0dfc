//! Authoritative host and its tick loop

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use glam::Vec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::net::protocol::{ClientMsg, ServerMsg, Snapshot};
use crate::net::WireEndpoint;
use crate::sim::{BodyProfile, Command, EntityId, EntityState, PhysicsConfig, Simulator, WorldState};
use crate::util::rate_limit::ClientRateLimiter;

use super::snapshot::{SnapshotBuilder, SnapshotStats};

/// Half-width of the square players spawn in around the origin
const SPAWN_RADIUS: f32 = 20.0;
/// Client frames buffered between reader tasks and the tick loop
const INPUT_CAPACITY: usize = 1024;
/// Log snapshot traffic every this many snapshots
const STATS_LOG_EVERY: u64 = 200;

/// Per-session bookkeeping on the authority
#[derive(Debug, Clone)]
struct ClientSlot {
    entity_id: EntityId,
    /// Not yet simulated, keyed by sequence
    queue: BTreeMap<u64, Command>,
    last_processed: Option<u64>,
}

/// Owns the authoritative world and applies one queued command per client
/// per tick through the same step function clients predict with.
pub struct AuthorityHost {
    config: EngineConfig,
    simulator: Simulator,
    world: WorldState,
    clients: BTreeMap<Uuid, ClientSlot>,
    next_entity: u32,
    rng: ChaCha8Rng,
    server_time: f64,
    snapshot_builder: SnapshotBuilder,
}

impl AuthorityHost {
    pub fn new(config: EngineConfig, seed: u64, snapshot_rate: u32, start_time_ms: f64) -> Self {
        Self {
            simulator: Simulator::new(PhysicsConfig::from(&config)),
            world: WorldState::new(),
            clients: BTreeMap::new(),
            next_entity: 1,
            rng: ChaCha8Rng::seed_from_u64(seed),
            server_time: start_time_ms,
            snapshot_builder: SnapshotBuilder::for_rates(config.tick_rate, snapshot_rate),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn world(&self) -> &WorldState {
        &self.world
    }

    /// Authority clock in ms, advanced by one fixed step per tick
    pub fn server_time(&self) -> f64 {
        self.server_time
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn entity_of(&self, session_id: Uuid) -> Option<EntityId> {
        self.clients.get(&session_id).map(|c| c.entity_id)
    }

    pub fn last_processed(&self, session_id: Uuid) -> Option<u64> {
        self.clients.get(&session_id)?.last_processed
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_entity);
        self.next_entity += 1;
        id
    }

    /// Place immovable scenery
    pub fn add_static(&mut self, position: Vec3, radius: f32) -> EntityId {
        let id = self.allocate_id();
        self.world = self
            .world
            .with_entity(id, EntityState::new(position, BodyProfile::obstacle(radius)));
        self.snapshot_builder.force_next();
        id
    }

    /// Spawn a player entity for `session_id`; joining twice returns the same entity
    pub fn join(&mut self, session_id: Uuid) -> EntityId {
        if let Some(existing) = self.entity_of(session_id) {
            return existing;
        }

        let body = BodyProfile::player();
        let bounds = self.config.world_bounds;
        let x = self.rng.gen_range(-SPAWN_RADIUS..SPAWN_RADIUS);
        let z = self.rng.gen_range(-SPAWN_RADIUS..SPAWN_RADIUS);
        let spawn = Vec3::new(x, bounds.min.y + body.radius, z).clamp(bounds.min, bounds.max);
        let yaw = self.rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI);

        let id = self.allocate_id();
        let mut state = EntityState::new(spawn, body);
        state.rotation.yaw = yaw;
        self.world = self.world.with_entity(id, state);
        self.clients.insert(
            session_id,
            ClientSlot {
                entity_id: id,
                queue: BTreeMap::new(),
                last_processed: None,
            },
        );
        self.snapshot_builder.force_next();

        info!(
            session_id = %session_id,
            entity_id = %id,
            client_count = self.clients.len(),
            "Client joined"
        );
        id
    }

    /// Remove a session and its entity
    pub fn leave(&mut self, session_id: Uuid) -> Option<EntityId> {
        let slot = self.clients.remove(&session_id)?;
        self.world = self.world.without_entity(slot.entity_id);
        self.snapshot_builder.force_next();
        info!(session_id = %session_id, entity_id = %slot.entity_id, "Client left");
        Some(slot.entity_id)
    }

    /// Queue a command. Duplicates, already-processed sequences and overflow
    /// beyond the pending cap are refused.
    pub fn submit(&mut self, session_id: Uuid, command: Command) -> bool {
        let cap = self.config.max_pending_commands;
        let Some(slot) = self.clients.get_mut(&session_id) else {
            debug!(session_id = %session_id, "Command from unknown session");
            return false;
        };
        if slot.last_processed.is_some_and(|last| command.sequence <= last)
            || slot.queue.contains_key(&command.sequence)
        {
            return false;
        }
        if slot.queue.len() >= cap {
            warn!(session_id = %session_id, queued = slot.queue.len(), "Command queue full");
            return false;
        }
        slot.queue.insert(command.sequence, command);
        true
    }

    /// Advance the world one tick. Returns per-session snapshots on ticks
    /// where the snapshot schedule fires, otherwise nothing.
    pub fn tick(&mut self) -> Vec<(Uuid, Snapshot)> {
        let mut commands = BTreeMap::new();
        for slot in self.clients.values_mut() {
            if let Some((sequence, command)) = slot.queue.pop_first() {
                slot.last_processed = Some(sequence);
                commands.insert(slot.entity_id, command);
            }
        }

        let dt = self.config.dt();
        self.world = self.simulator.step(&self.world, &commands, dt);
        self.server_time += dt as f64 * 1000.0;

        if !self.snapshot_builder.should_send() {
            return Vec::new();
        }
        self.clients
            .keys()
            .filter_map(|&session_id| Some((session_id, self.snapshot_for(session_id)?)))
            .collect()
    }

    /// Current snapshot for one session
    pub fn snapshot_for(&self, session_id: Uuid) -> Option<Snapshot> {
        let slot = self.clients.get(&session_id)?;
        Some(
            self.snapshot_builder
                .build(&self.world, self.server_time, slot.last_processed),
        )
    }

    /// Serve clients arriving on `connections` until `shutdown` flips
    pub async fn run(mut self, mut connections: mpsc::Receiver<WireEndpoint>, mut shutdown: watch::Receiver<bool>) {
        info!(tick_rate = self.config.tick_rate, "Authority started");

        let (input_tx, mut input_rx) = mpsc::channel(INPUT_CAPACITY);
        let mut links: HashMap<u64, ClientLink> = HashMap::new();
        let mut next_conn = 0u64;
        let mut stats = SnapshotStats::default();

        let tick_duration = Duration::from_secs_f64(1.0 / self.config.tick_rate.max(1) as f64);
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            // Accept new links
            while let Ok(endpoint) = connections.try_recv() {
                next_conn += 1;
                let reader = tokio::spawn(read_frames(
                    next_conn,
                    endpoint.incoming,
                    input_tx.clone(),
                    ClientRateLimiter::for_tick_rate(self.config.tick_rate),
                ));
                links.insert(
                    next_conn,
                    ClientLink {
                        outgoing: endpoint.outgoing,
                        session_id: None,
                        reader,
                    },
                );
                debug!(conn_id = next_conn, "Link accepted");
            }

            // Drain input queue
            while let Ok(frame) = input_rx.try_recv() {
                self.handle_frame(frame, &mut links);
            }

            for (session_id, snapshot) in self.tick() {
                let Some(link) = links.values().find(|l| l.session_id == Some(session_id)) else {
                    continue;
                };
                let entity_count = snapshot.entities.len();
                match ServerMsg::Snapshot(snapshot).encode() {
                    Ok(text) => {
                        stats.record(entity_count, text.len());
                        link.send_text(text);
                        if stats.total_snapshots % STATS_LOG_EVERY == 0 {
                            debug!(
                                snapshots = stats.total_snapshots,
                                bytes = stats.total_bytes,
                                avg_entities = stats.avg_entities_per_snapshot,
                                "Snapshot traffic"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode snapshot"),
                }
            }
        }

        for link in links.into_values() {
            link.reader.abort();
        }
        info!(tick = self.world.tick(), "Authority stopped");
    }

    fn handle_frame(&mut self, frame: ClientFrame, links: &mut HashMap<u64, ClientLink>) {
        let Some(link) = links.get_mut(&frame.conn_id) else {
            return;
        };

        match frame.msg {
            Some(ClientMsg::Hello { session_id }) => {
                let entity_id = self.join(session_id);
                link.session_id = Some(session_id);
                link.send(&ServerMsg::Welcome {
                    session_id,
                    entity_id,
                    server_time: self.server_time,
                    tick_rate: self.config.tick_rate,
                });
            }
            Some(ClientMsg::Command { command }) => match link.session_id {
                Some(session_id) => {
                    self.submit(session_id, command);
                }
                None => link.send(&ServerMsg::Error {
                    code: "not_joined".to_string(),
                    message: "Send hello before commands".to_string(),
                }),
            },
            Some(ClientMsg::Ping { client_time }) => {
                link.send(&ServerMsg::Pong {
                    client_time,
                    server_time: self.server_time,
                });
            }
            Some(ClientMsg::Leave) => {
                if let Some(session_id) = link.session_id.take() {
                    self.depart(session_id, links);
                }
            }
            None => {
                if let Some(link) = links.remove(&frame.conn_id) {
                    if let Some(session_id) = link.session_id {
                        self.depart(session_id, links);
                    }
                }
                debug!(conn_id = frame.conn_id, "Link closed");
            }
        }
    }

    fn depart(&mut self, session_id: Uuid, links: &HashMap<u64, ClientLink>) {
        let Some(entity_id) = self.leave(session_id) else {
            return;
        };
        let removed = ServerMsg::EntityRemoved { entity_id };
        for link in links.values().filter(|l| l.session_id.is_some()) {
            link.send(&removed);
        }
    }
}

/// Decoded frame from one link; `None` means the link closed
#[derive(Debug)]
struct ClientFrame {
    conn_id: u64,
    msg: Option<ClientMsg>,
}

struct ClientLink {
    outgoing: mpsc::Sender<String>,
    session_id: Option<Uuid>,
    reader: JoinHandle<()>,
}

impl ClientLink {
    fn send(&self, msg: &ServerMsg) {
        match msg.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => warn!(error = %e, "Failed to encode message"),
        }
    }

    fn send_text(&self, text: String) {
        match self.outgoing.try_send(text) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Don't disconnect for lag
                warn!(session_id = ?self.session_id, "Client lagged, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = ?self.session_id, "Link writer closed");
            }
        }
    }
}

/// Reader loop: link -> tick loop
async fn read_frames(
    conn_id: u64,
    mut incoming: mpsc::Receiver<String>,
    input_tx: mpsc::Sender<ClientFrame>,
    rate_limiter: ClientRateLimiter,
) {
    while let Some(text) = incoming.recv().await {
        if !rate_limiter.check_frame() {
            warn!(conn_id, "Rate limited client frame");
            continue;
        }

        match ClientMsg::decode(&text) {
            Ok(msg) => {
                let frame = ClientFrame {
                    conn_id,
                    msg: Some(msg),
                };
                if input_tx.send(frame).await.is_err() {
                    debug!(conn_id, "Input channel closed");
                    return;
                }
            }
            Err(e) => {
                warn!(conn_id, error = %e, "Failed to parse client message");
            }
        }
    }

    // Signal disconnect to the tick loop
    let _ = input_tx.send(ClientFrame { conn_id, msg: None }).await;
}
