//! Prediction and reconciliation against a real authority, without a network

use std::collections::VecDeque;

use glam::Vec3;
use uuid::Uuid;

use predictive_sync::client::{InputSequencer, Predictor, PredictorState, Reconciler};
use predictive_sync::config::EngineConfig;
use predictive_sync::net::{EntitySnapshot, Snapshot};
use predictive_sync::server::AuthorityHost;
use predictive_sync::sim::{
    ActionFlags, BodyProfile, Command, EntityId, EntityState, LookDelta, MovementFlags, Simulator,
    WorldState,
};

fn movement_for(tick: u64) -> MovementFlags {
    MovementFlags {
        forward: tick % 40 < 25,
        right: tick % 60 >= 30,
        sprint: tick % 90 < 20,
        jump: tick % 70 == 5,
        ..Default::default()
    }
}

fn look_for(tick: u64) -> LookDelta {
    LookDelta::new(if tick % 10 == 0 { 0.05 } else { 0.0 }, 0.0)
}

fn every_tick_config() -> (EngineConfig, u32) {
    let config = EngineConfig::default();
    let rate = config.tick_rate;
    (config, rate)
}

#[test]
fn ack_drops_prefix_and_replays_from_authoritative_base() {
    let config = EngineConfig::default();
    let id = EntityId(1);
    let mut predictor = Predictor::from_config(id, &config);
    let mut reconciler = Reconciler::new();
    let mut sequencer = InputSequencer::detached(Uuid::new_v4());

    // First authoritative state starts prediction
    let spawn = EntityState::new(Vec3::new(0.0, 0.5, 0.0), BodyProfile::player());
    let first = Snapshot {
        server_time: 100.0,
        tick: 0,
        last_processed_input: None,
        entities: vec![EntitySnapshot { id, state: spawn }],
    };
    reconciler.reconcile(&mut predictor, &first).unwrap();
    assert_eq!(predictor.state(), PredictorState::Predicting);

    let mut commands = Vec::new();
    let mut predicted = Vec::new();
    for t in 1..=10u64 {
        let command = sequencer.issue(movement_for(t), LookDelta::default(), ActionFlags::default(), t as f64);
        predictor.apply(command).unwrap();
        commands.push(command);
        predicted.push(*predictor.predicted_state().unwrap());
    }
    let stale = predicted[9];

    // Authority has processed 1..=7 and puts the entity 0.3 to the side of our tick 7
    let mut authoritative = predicted[6];
    authoritative.position += Vec3::new(0.3, 0.0, 0.0);
    let snapshot = Snapshot {
        server_time: 500.0,
        tick: 7,
        last_processed_input: Some(7),
        entities: vec![EntitySnapshot {
            id,
            state: authoritative,
        }],
    };
    let report = reconciler.reconcile(&mut predictor, &snapshot).unwrap();

    assert_eq!(report.dropped, 7);
    assert_eq!(report.replayed, 3);
    let pending: Vec<u64> = predictor.pending().map(|c| c.sequence).collect();
    assert_eq!(pending, vec![8, 9, 10]);

    // Ticks 8..=10 are rebuilt on the authoritative state, not our stale one
    let mut simulator = Simulator::new((&config).into());
    let mut expected = WorldState::from_entities(7, [(id, authoritative)]);
    for command in &commands[7..] {
        expected = simulator.step_entity(&expected, id, command, config.dt());
    }
    let rebuilt = *predictor.predicted_state().unwrap();
    assert_eq!(Some(&rebuilt), expected.get(id));

    let shift = rebuilt.position - stale.position;
    assert!((shift.x - 0.3).abs() < 1e-4, "shift = {shift}");
    assert!(shift.y.abs() < 1e-5 && shift.z.abs() < 1e-5, "shift = {shift}");
    assert!((report.correction - 0.3).abs() < 1e-4);
}

#[test]
fn zero_latency_prediction_never_corrects() {
    let (config, rate) = every_tick_config();
    let mut host = AuthorityHost::new(config.clone(), 11, rate, 0.0);
    host.add_static(Vec3::new(3.0, 1.0, -4.0), 1.0);
    let session = Uuid::new_v4();
    let id = host.join(session);

    let mut predictor = Predictor::from_config(id, &config);
    let mut reconciler = Reconciler::new();
    let mut sequencer = InputSequencer::detached(session);

    for tick in 1..=300u64 {
        let command = sequencer.issue(movement_for(tick), look_for(tick), ActionFlags::default(), tick as f64);
        predictor.apply(command).unwrap();
        assert!(host.submit(session, command));

        for (to, snapshot) in host.tick() {
            assert_eq!(to, session);
            let report = reconciler.reconcile(&mut predictor, &snapshot).unwrap();
            if tick > 1 {
                assert_eq!(report.correction, 0.0, "corrected at tick {tick}");
            }
            assert_eq!(predictor.pending_len(), 0);
        }
    }
    assert_eq!(predictor.predicted_state(), host.world().get(id));
}

#[test]
fn delayed_links_converge_once_input_stops() {
    let (config, rate) = every_tick_config();
    let mut host = AuthorityHost::new(config.clone(), 5, rate, 0.0);
    let session = Uuid::new_v4();
    let id = host.join(session);

    let mut predictor = Predictor::from_config(id, &config);
    let mut reconciler = Reconciler::new();
    let mut sequencer = InputSequencer::detached(session);

    const UPLINK_TICKS: usize = 4;
    const DOWNLINK_TICKS: usize = 6;
    let mut uplink: VecDeque<Option<Command>> = VecDeque::from(vec![None; UPLINK_TICKS]);
    let mut downlink: VecDeque<Vec<Snapshot>> = VecDeque::from(vec![Vec::new(); DOWNLINK_TICKS]);
    let mut last_applied: Option<Snapshot> = None;
    let mut mid_stream_acks = 0;

    for tick in 1..=400u64 {
        let sending = tick <= 240;
        let outgoing = sending.then(|| {
            let command = sequencer.issue(movement_for(tick), look_for(tick), ActionFlags::default(), tick as f64);
            predictor.apply(command).unwrap();
            command
        });

        uplink.push_back(outgoing);
        if let Some(Some(command)) = uplink.pop_front() {
            host.submit(session, command);
        }

        let snapshots = host.tick().into_iter().map(|(_, s)| s).collect();
        downlink.push_back(snapshots);
        for snapshot in downlink.pop_front().unwrap_or_default() {
            let previous_ack = last_applied.as_ref().and_then(|s| s.last_processed_input);
            if let Some(report) = reconciler.reconcile(&mut predictor, &snapshot) {
                // Every tick since the previous snapshot consumed one of our
                // commands, so the rebuilt prediction must match exactly
                if snapshot.last_processed_input != previous_ack {
                    assert_eq!(report.correction, 0.0, "corrected at ack {:?}", report.acknowledged);
                    mid_stream_acks += 1;
                }
                last_applied = Some(snapshot);
            }
        }
    }

    assert_eq!(mid_stream_acks, 240);
    let last = last_applied.expect("snapshots were delivered");
    assert_eq!(last.last_processed_input, Some(240));
    assert_eq!(predictor.pending_len(), 0);
    assert_eq!(predictor.predicted_state(), last.entity(id));
}

#[test]
fn reordered_and_duplicated_snapshots_are_harmless() {
    let (config, rate) = every_tick_config();
    let mut host = AuthorityHost::new(config.clone(), 9, rate, 0.0);
    let session = Uuid::new_v4();
    let id = host.join(session);

    let mut predictor = Predictor::from_config(id, &config);
    let mut reconciler = Reconciler::new();
    let mut sequencer = InputSequencer::detached(session);

    let mut produced = Vec::new();
    for tick in 1..=30u64 {
        let command = sequencer.issue(movement_for(tick), LookDelta::default(), ActionFlags::default(), tick as f64);
        predictor.apply(command).unwrap();
        host.submit(session, command);
        produced.extend(host.tick().into_iter().map(|(_, s)| s));
    }

    let newest = produced.last().cloned().unwrap();
    reconciler.reconcile(&mut predictor, &newest).unwrap();
    let settled = predictor.predicted_state().copied();

    // Older and repeated snapshots arriving late change nothing
    for snapshot in produced.iter().rev() {
        assert!(reconciler.reconcile(&mut predictor, snapshot).is_none());
    }
    assert_eq!(predictor.predicted_state().copied(), settled);
    assert_eq!(predictor.pending_len(), 0);
}
