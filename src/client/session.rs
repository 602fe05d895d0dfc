//! Client sync session
//!
//! Owns the per-client pipeline: capture → predict → reconcile on the
//! simulation side, and feeds the snapshot buffer for remote entities. The
//! network pump talks to it only through channels; the renderer reads through
//! a [`RenderView`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::net::protocol::{ConnectionEvent, Snapshot};
use crate::sim::{Command, EntityId, EntityState};
use crate::util::time::{unix_millis_f64, FixedTimestep};

use super::input::{InputSequencer, InputState};
use super::interpolation::SnapshotBuffer;
use super::predictor::Predictor;
use super::reconcile::{ReconcileReport, ReconcileStats, Reconciler};
use super::SyncError;

/// Outbound command queue depth between session and pump
const OUTBOUND_CAPACITY: usize = 256;
/// Inbound message queue depth between pump and session
const INBOUND_CAPACITY: usize = 256;

/// Decoded, validated message handed from the network pump to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Welcome {
        session_id: Uuid,
        entity_id: EntityId,
        server_time: f64,
    },
    Snapshot(Snapshot),
    EntityRemoved(EntityId),
    Connection(ConnectionEvent),
}

/// Why the session stopped predicting
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DesyncReason {
    /// Too many unacknowledged commands
    PendingOverflow { pending: usize },
    /// No snapshot for longer than the configured timeout
    SnapshotTimeout { silence_ms: f64 },
}

/// Notifications for the application layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { entity_id: EntityId },
    Connection(ConnectionEvent),
    /// Prediction halted; the application should resync or reconnect
    Desynced(DesyncReason),
    /// A fresh snapshot arrived after a desync and prediction resumed
    Resynced,
    Left,
}

/// Channel ends the network pump drives
#[derive(Debug)]
pub struct SessionLink {
    pub session_id: Uuid,
    pub commands: mpsc::Receiver<Command>,
    pub inbound: mpsc::Sender<Inbound>,
}

/// Read-only access for the render thread
#[derive(Debug, Clone)]
pub struct RenderView {
    local: watch::Receiver<Option<EntityState>>,
    remote: Arc<SnapshotBuffer>,
}

impl RenderView {
    /// Latest predicted local entity
    pub fn local_render_state(&self) -> Option<EntityState> {
        *self.local.borrow()
    }

    /// Remote entity at `render_timestamp` (server clock) minus the interpolation delay
    pub fn remote_render_state(&self, id: EntityId, render_timestamp: f64) -> Option<EntityState> {
        self.remote.query(id, render_timestamp)
    }

    pub fn remote_entities(&self) -> Vec<EntityId> {
        self.remote.entity_ids()
    }

    /// Wait until the local render state changes
    pub async fn changed(&mut self) -> bool {
        self.local.changed().await.is_ok()
    }
}

/// Everything the caller needs besides the session itself
#[derive(Debug)]
pub struct SessionHandle {
    pub link: SessionLink,
    pub view: RenderView,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub struct SyncSession {
    config: EngineConfig,
    sequencer: InputSequencer,
    predictor: Option<Predictor>,
    reconciler: Reconciler,
    remote: Arc<SnapshotBuffer>,
    inbound_rx: mpsc::Receiver<Inbound>,
    local_tx: watch::Sender<Option<EntityState>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    timestep: FixedTimestep,
    connected: bool,
    last_snapshot_at: Option<f64>,
    desync: Option<DesyncReason>,
}

impl SyncSession {
    pub fn new(config: EngineConfig, session_id: Uuid) -> (Self, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (local_tx, local_rx) = watch::channel(None);
        let remote = Arc::new(SnapshotBuffer::from_config(&config));

        let session = Self {
            sequencer: InputSequencer::new(session_id, commands_tx),
            predictor: None,
            reconciler: Reconciler::new(),
            remote: Arc::clone(&remote),
            inbound_rx,
            local_tx,
            events_tx,
            timestep: FixedTimestep::new(config.tick_rate, config.max_sub_steps),
            connected: false,
            last_snapshot_at: None,
            desync: None,
            config,
        };

        let handle = SessionHandle {
            link: SessionLink {
                session_id,
                commands: commands_rx,
                inbound: inbound_tx,
            },
            view: RenderView {
                local: local_rx,
                remote,
            },
            events: events_rx,
        };

        (session, handle)
    }

    pub fn session_id(&self) -> Uuid {
        self.sequencer.session_id()
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.predictor.as_ref().map(|p| p.entity_id())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn desync(&self) -> Option<DesyncReason> {
        self.desync
    }

    pub fn pending_commands(&self) -> usize {
        self.predictor.as_ref().map_or(0, |p| p.pending_len())
    }

    pub fn reconcile_stats(&self) -> ReconcileStats {
        self.reconciler.stats()
    }

    /// Feed one render frame; runs as many fixed ticks as the accumulator allows
    pub fn advance(&mut self, frame_secs: f64, input: &mut InputState) -> u32 {
        let steps = self.timestep.advance(frame_secs);
        for _ in 0..steps {
            self.tick(input, unix_millis_f64());
        }
        steps
    }

    /// Run one fixed tick at wall-clock `now_ms`
    pub fn tick(&mut self, input: &mut InputState, now_ms: f64) {
        self.drain_inbound(now_ms);
        self.check_snapshot_timeout(now_ms);

        if self.connected && self.desync.is_none() {
            self.capture(input, now_ms);
        }

        self.publish_local();
    }

    fn capture(&mut self, input: &mut InputState, now_ms: f64) {
        let Some(predictor) = self.predictor.as_mut() else {
            return;
        };
        if predictor.is_full() {
            let pending = predictor.pending_len();
            self.raise_desync(DesyncReason::PendingOverflow { pending });
            return;
        }

        let command = self.sequencer.capture_at(input, now_ms);
        if let Err(err) = predictor.apply(command) {
            match err {
                SyncError::PendingOverflow { pending, .. } => {
                    self.raise_desync(DesyncReason::PendingOverflow { pending });
                }
                other => warn!(error = %other, "Command rejected by predictor"),
            }
        }
    }

    fn drain_inbound(&mut self, now_ms: f64) {
        while let Ok(msg) = self.inbound_rx.try_recv() {
            match msg {
                Inbound::Welcome {
                    session_id,
                    entity_id,
                    server_time,
                } => self.on_welcome(session_id, entity_id, server_time, now_ms),
                Inbound::Snapshot(snapshot) => {
                    self.on_snapshot(&snapshot, now_ms);
                }
                Inbound::EntityRemoved(id) => {
                    self.remote.remove(id);
                }
                Inbound::Connection(event) => self.on_connection(event, now_ms),
            }
        }
    }

    fn on_welcome(&mut self, session_id: Uuid, entity_id: EntityId, server_time: f64, now_ms: f64) {
        if session_id != self.session_id() {
            warn!(expected = %self.session_id(), got = %session_id, "Welcome for another session ignored");
            return;
        }
        info!(session_id = %session_id, entity_id = %entity_id, server_time, "Joined");

        self.predictor = Some(Predictor::from_config(entity_id, &self.config));
        self.reconciler.reset();
        self.remote.remove(entity_id);
        self.last_snapshot_at = Some(now_ms);
        self.connected = true;
        self.emit(SessionEvent::Joined { entity_id });
    }

    fn on_snapshot(&mut self, snapshot: &Snapshot, now_ms: f64) -> Option<ReconcileReport> {
        let local = self.entity_id();
        let accepted = self.remote.ingest(snapshot, local);

        let predictor = self.predictor.as_mut()?;
        let report = self.reconciler.reconcile(predictor, snapshot);

        // Stale or duplicate snapshots do not count as the authority being alive
        if accepted > 0 || report.is_some() {
            self.last_snapshot_at = Some(now_ms);
        }
        let report = report?;

        if self.desync.is_some() && !predictor.is_full() {
            info!(server_time = snapshot.server_time, "Resynced from snapshot");
            self.desync = None;
            self.emit(SessionEvent::Resynced);
        }
        Some(report)
    }

    fn on_connection(&mut self, event: ConnectionEvent, now_ms: f64) {
        match event {
            ConnectionEvent::Connected => {
                self.connected = true;
                self.last_snapshot_at = Some(now_ms);
            }
            ConnectionEvent::Disconnected | ConnectionEvent::Reconnecting { .. } => {
                self.connected = false;
            }
        }
        debug!(?event, "Connection state changed");
        self.emit(SessionEvent::Connection(event));
    }

    fn check_snapshot_timeout(&mut self, now_ms: f64) {
        if !self.connected || self.desync.is_some() || self.predictor.is_none() {
            return;
        }
        let Some(last) = self.last_snapshot_at else {
            return;
        };
        let silence_ms = now_ms - last;
        if silence_ms > self.config.snapshot_timeout_ms {
            self.raise_desync(DesyncReason::SnapshotTimeout { silence_ms });
        }
    }

    fn raise_desync(&mut self, reason: DesyncReason) {
        if self.desync.is_some() {
            return;
        }
        warn!(?reason, session_id = %self.session_id(), "Session desynced, prediction halted");
        self.desync = Some(reason);
        self.emit(SessionEvent::Desynced(reason));
    }

    fn publish_local(&self) {
        let state = self
            .predictor
            .as_ref()
            .and_then(|p| p.predicted_state().copied());
        self.local_tx.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }

    /// Latest predicted local entity
    pub fn local_render_state(&self) -> Option<EntityState> {
        self.predictor
            .as_ref()
            .and_then(|p| p.predicted_state().copied())
    }

    pub fn remote_render_state(&self, id: EntityId, render_timestamp: f64) -> Option<EntityState> {
        self.remote.query(id, render_timestamp)
    }

    /// Drop all prediction and interpolation state. Unacknowledged commands
    /// are discarded; the caller shuts the pump down.
    pub fn leave(&mut self) {
        info!(session_id = %self.session_id(), "Leaving session");
        self.clear();
        self.emit(SessionEvent::Left);
    }

    /// Start over under a fresh session id with new channels to a new pump
    pub fn reconnect(&mut self, session_id: Uuid) -> SessionLink {
        self.clear();
        let (commands_tx, commands_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        self.sequencer.reset_session(session_id);
        self.sequencer.set_outbound(commands_tx);
        self.inbound_rx = inbound_rx;

        SessionLink {
            session_id,
            commands: commands_rx,
            inbound: inbound_tx,
        }
    }

    fn clear(&mut self) {
        self.predictor = None;
        self.reconciler.reset();
        self.remote.clear();
        self.timestep.reset();
        self.connected = false;
        self.last_snapshot_at = None;
        self.desync = None;
        self.local_tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::net::protocol::EntitySnapshot;
    use crate::sim::BodyProfile;

    fn welcome(session: &SyncSession, id: EntityId) -> Inbound {
        Inbound::Welcome {
            session_id: session.session_id(),
            entity_id: id,
            server_time: 0.0,
        }
    }

    fn snapshot(server_time: f64, ack: Option<u64>, entities: &[(EntityId, f32)]) -> Inbound {
        Inbound::Snapshot(Snapshot {
            server_time,
            tick: 1,
            last_processed_input: ack,
            entities: entities
                .iter()
                .map(|&(id, x)| EntitySnapshot {
                    id,
                    state: EntityState::new(Vec3::new(x, 0.5, 0.0), BodyProfile::player()),
                })
                .collect(),
        })
    }

    #[test]
    fn test_join_then_snapshot_starts_prediction() {
        let (mut session, mut handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        let me = EntityId(1);

        handle.link.inbound.try_send(welcome(&session, me)).unwrap();
        handle
            .link
            .inbound
            .try_send(snapshot(10.0, None, &[(me, 0.0), (EntityId(2), 4.0)]))
            .unwrap();
        session.tick(&mut input, 0.0);

        assert_eq!(session.entity_id(), Some(me));
        assert!(handle.view.local_render_state().is_some());
        assert_eq!(handle.view.remote_entities(), vec![EntityId(2)]);
        assert_eq!(handle.events.try_recv().ok(), Some(SessionEvent::Joined { entity_id: me }));
        // Command captured this tick went out to the pump
        assert_eq!(handle.link.commands.try_recv().map(|c| c.sequence).ok(), Some(1));
    }

    #[test]
    fn test_no_commands_before_welcome() {
        let (mut session, mut handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        session.tick(&mut input, 0.0);
        assert!(handle.link.commands.try_recv().is_err());
        assert!(handle.view.local_render_state().is_none());
    }

    #[test]
    fn test_pending_overflow_raises_desync() {
        let config = EngineConfig {
            max_pending_commands: 5,
            snapshot_timeout_ms: 1.0e9,
            ..Default::default()
        };
        let (mut session, mut handle) = SyncSession::new(config, Uuid::new_v4());
        let mut input = InputState::new();
        handle.link.inbound.try_send(welcome(&session, EntityId(1))).unwrap();

        for i in 0..10 {
            session.tick(&mut input, i as f64);
        }
        assert_eq!(session.pending_commands(), 5);
        assert_eq!(session.desync(), Some(DesyncReason::PendingOverflow { pending: 5 }));

        let events: Vec<SessionEvent> = std::iter::from_fn(|| handle.events.try_recv().ok()).collect();
        let desyncs = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Desynced(_)))
            .count();
        assert_eq!(desyncs, 1);

        // Ack everything and prediction resumes
        handle
            .link
            .inbound
            .try_send(snapshot(20.0, Some(5), &[(EntityId(1), 0.0)]))
            .unwrap();
        session.tick(&mut input, 20.0);
        assert!(session.desync().is_none());
        assert_eq!(handle.events.try_recv().ok(), Some(SessionEvent::Resynced));
    }

    #[test]
    fn test_snapshot_timeout_raises_desync() {
        let (mut session, handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        handle.link.inbound.try_send(welcome(&session, EntityId(1))).unwrap();

        session.tick(&mut input, 0.0);
        session.tick(&mut input, 500.0);
        assert!(session.desync().is_none());
        session.tick(&mut input, 1500.0);
        assert!(matches!(
            session.desync(),
            Some(DesyncReason::SnapshotTimeout { .. })
        ));
    }

    #[test]
    fn test_repeated_stale_snapshot_still_times_out() {
        let (mut session, handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        let me = EntityId(1);
        let frame = || snapshot(10.0, None, &[(me, 0.0), (EntityId(2), 4.0)]);

        handle.link.inbound.try_send(welcome(&session, me)).unwrap();
        handle.link.inbound.try_send(frame()).unwrap();
        session.tick(&mut input, 0.0);
        assert_eq!(session.reconcile_stats().applied, 1);

        for now in [400.0, 800.0, 1200.0] {
            handle.link.inbound.try_send(frame()).unwrap();
            session.tick(&mut input, now);
        }
        assert_eq!(session.reconcile_stats().stale, 3);
        assert!(matches!(
            session.desync(),
            Some(DesyncReason::SnapshotTimeout { silence_ms }) if silence_ms > 1000.0
        ));
    }

    #[test]
    fn test_welcome_for_other_session_ignored() {
        let (mut session, handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        handle
            .link
            .inbound
            .try_send(Inbound::Welcome {
                session_id: Uuid::new_v4(),
                entity_id: EntityId(1),
                server_time: 0.0,
            })
            .unwrap();
        session.tick(&mut input, 0.0);
        assert!(session.entity_id().is_none());
    }

    #[test]
    fn test_leave_clears_state() {
        let (mut session, mut handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        let me = EntityId(1);
        handle.link.inbound.try_send(welcome(&session, me)).unwrap();
        handle
            .link
            .inbound
            .try_send(snapshot(10.0, None, &[(me, 0.0), (EntityId(2), 4.0)]))
            .unwrap();
        session.tick(&mut input, 0.0);

        session.leave();
        assert!(session.entity_id().is_none());
        assert!(handle.view.local_render_state().is_none());
        assert!(handle.view.remote_entities().is_empty());
        let last = std::iter::from_fn(|| handle.events.try_recv().ok()).last();
        assert_eq!(last, Some(SessionEvent::Left));
    }

    #[test]
    fn test_reconnect_restarts_sequence() {
        let (mut session, handle) = SyncSession::new(EngineConfig::default(), Uuid::new_v4());
        let mut input = InputState::new();
        handle.link.inbound.try_send(welcome(&session, EntityId(1))).unwrap();
        session.tick(&mut input, 0.0);
        session.tick(&mut input, 1.0);

        let fresh = Uuid::new_v4();
        let mut link = session.reconnect(fresh);
        link.inbound
            .try_send(Inbound::Welcome {
                session_id: fresh,
                entity_id: EntityId(7),
                server_time: 0.0,
            })
            .unwrap();
        session.tick(&mut input, 2.0);
        assert_eq!(session.entity_id(), Some(EntityId(7)));
        assert_eq!(link.commands.try_recv().map(|c| c.sequence).ok(), Some(1));
    }
}
