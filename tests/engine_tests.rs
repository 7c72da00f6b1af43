use cansim::scheduler::ScheduleState;
use cansim::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

fn engine_data() -> MessageDefinition {
    MessageDefinition::new(0x100, "EngineData", 8)
        .with_cycle_time(100)
        .with_node("engine")
        .with_signal(
            SignalDefinition::new("RPM", 24, 16)
                .with_scaling(0.125, 0.0)
                .with_range(0.0, 8000.0)
                .with_unit("rpm"),
        )
}

fn config() -> SimConfig {
    SimConfig::default()
        .with_seed(99)
        .with_jitter_percent(0.0)
        .with_node(Node::new("engine", "Engine ECU", 1, NodeRole::Ecu))
        .with_message(engine_data())
}

#[test]
fn test_periodic_cadence() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(1_000);

    let frames = engine.drain_events();
    assert_eq!(frames.len(), 10);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.id, 0x100);
        assert_eq!(frame.source, "engine");
        assert_eq!(frame.length, 8);
        assert!((frame.timestamp_ms - 100.0 * (i as f64 + 1.0)).abs() < 1e-6);
    }
}

#[test]
fn test_speed_factor_compresses_host_time() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(10.0).unwrap();
    // 100 ms of host time at 10x is one simulated second.
    engine.tick(100);
    assert_eq!(engine.frame_count(0x100), 10);
    assert!((engine.now_ms() - 1_000.0).abs() < 1e-6);
}

#[test]
fn test_jitter_stays_within_bounds() {
    let config = config().with_jitter_percent(20.0);
    let mut engine = SimulationEngine::new(config).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(10_000);

    let frames = engine.drain_events();
    assert!(frames.len() >= 80);
    for pair in frames.windows(2) {
        let gap = pair[1].timestamp_ms - pair[0].timestamp_ms;
        assert!((80.0 - 1e-3..=120.0 + 1e-3).contains(&gap), "gap {}", gap);
    }
}

#[test]
fn test_no_frames_after_stop() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(500);
    engine.stop();
    engine.drain_events();

    assert!(!engine.is_running());
    assert_eq!(engine.pending_timers(), 0);
    assert_eq!(engine.schedule_state(0x100), Some(ScheduleState::Inactive));

    engine.tick(5_000);
    engine.run_simulated(5_000);
    assert!(engine.drain_events().is_empty());

    // Stopping twice is harmless.
    engine.stop();
    assert!(!engine.is_running());
}

#[test]
fn test_restart_resets_counters_and_clock() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(2_000);
    engine.stop();
    assert_eq!(engine.statistics().message_count, 20);

    engine.start(1.0).unwrap();
    assert_eq!(engine.now_ms(), 0.0);
    assert_eq!(engine.statistics().message_count, 0);
    engine.run_simulated(300);
    assert_eq!(engine.frame_count(0x100), 3);
    assert_eq!(engine.get_state().runs, 2);
}

#[test]
fn test_raw_send_decodes_known_signals() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();
    engine
        .send_message(SendRequest::Raw {
            id: 0x100,
            data: vec![0x00, 0x00, 0x00, 0xA0, 0x0F, 0x00, 0x00, 0x00],
            extended: false,
        })
        .unwrap();

    let frames = engine.drain_events();
    assert_eq!(frames.len(), 1);
    let rpm = frames[0].signal("RPM").unwrap();
    assert_eq!(rpm.raw, 4000);
    assert_eq!(rpm.physical, 500.0);
    assert_eq!(frames[0].name, "EngineData");
    assert_eq!(engine.signal_value(0x100, "RPM"), Some(500.0));
}

#[test]
fn test_raw_send_validation() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();

    let too_long = engine.send_message(SendRequest::Raw {
        id: 0x123,
        data: vec![0; 9],
        extended: false,
    });
    assert!(matches!(too_long, Err(EngineError::PayloadTooLong { len: 9, max: 8 })));

    let bad_id = engine.send_message(SendRequest::Raw {
        id: 0x2000_0000,
        data: vec![],
        extended: true,
    });
    assert!(matches!(bad_id, Err(EngineError::InvalidIdentifier(_))));

    engine
        .send_message(SendRequest::Raw {
            id: 0x1234_5678,
            data: vec![1, 2, 3],
            extended: false,
        })
        .unwrap();
    let frames = engine.drain_events();
    assert!(frames[0].extended);
    assert_eq!(frames[0].name, "Raw");
}

#[test]
fn test_can_fd_allows_long_payloads() {
    let config = SimConfig::default()
        .with_seed(1)
        .with_can_fd(true)
        .with_message(MessageDefinition::new(0x300, "FdFrame", 64).with_cycle_time(10))
        .with_message(MessageDefinition::new(0x301, "BadLength", 10));
    let mut engine = SimulationEngine::new(config).unwrap();
    assert!(engine.message(0x300).is_some());
    assert!(engine.message(0x301).is_none());

    engine.start(1.0).unwrap();
    engine.run_simulated(100);
    let frames = engine.drain_events();
    assert!(!frames.is_empty());
    assert!(frames.iter().all(|f| f.data.len() == 64));
}

#[test]
fn test_signal_request_holds_manual_value() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();

    let mut values = BTreeMap::new();
    values.insert("RPM".to_string(), 500.0);
    engine
        .send_message(SendRequest::Signals { id: 0x100, values })
        .unwrap();
    engine.run_simulated(2_000);

    let frames = engine.drain_events();
    assert_eq!(frames.len(), 21);
    for frame in &frames {
        assert_eq!(frame.signal("RPM").unwrap().physical, 500.0);
    }

    let unknown = engine.send_message(SendRequest::Signals {
        id: 0x999,
        values: BTreeMap::new(),
    });
    assert!(matches!(unknown, Err(EngineError::UnknownMessage(0x999))));
}

#[test]
fn test_seeded_sessions_are_reproducible() {
    let run = || {
        let mut engine = SimulationEngine::new(config().with_jitter_percent(10.0)).unwrap();
        engine.start(1.0).unwrap();
        engine.run_simulated(3_000);
        engine.drain_events()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_statistics_are_published_and_monotonic() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&snapshots);
    engine.on_statistics(move |snapshot| sink.lock().unwrap().push(*snapshot));

    engine.start(1.0).unwrap();
    engine.run_simulated(5_000);

    let snapshots = snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 5);
    for pair in snapshots.windows(2) {
        assert!(pair[1].timestamp_ms > pair[0].timestamp_ms);
        assert!(pair[1].message_count >= pair[0].message_count);
    }
    let last = snapshots.last().unwrap();
    assert!(last.bus_load > 0.0 && last.bus_load <= 100.0);
    assert!((last.frames_per_second - 10.0).abs() < 0.5);
    assert_eq!(last.error_count, 0);
}

#[test]
fn test_history_tracks_recent_frames() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(1_000);
    engine.drain_events();

    let history = engine.history();
    assert_eq!(history.len(), 10);
    assert_eq!(history.latest().unwrap().id, 0x100);
    assert_eq!(history.tail(3).len(), 3);
}

#[test]
fn test_unknown_node_assignment_is_tolerated() {
    let config = SimConfig::default()
        .with_seed(1)
        .with_message(MessageDefinition::new(0x10, "Orphan", 1).with_cycle_time(50).with_node("ghost"));
    let mut engine = SimulationEngine::new(config).unwrap();
    assert!(engine.node("ghost").is_none());
    engine.start(1.0).unwrap();
    engine.run_simulated(100);
    assert_eq!(engine.frame_count(0x10), 2);
}

#[test]
fn test_overflowing_scale_does_not_stop_transmission() {
    let config = SimConfig::default().with_seed(7).with_message(
        MessageDefinition::new(0x120, "Huge", 8)
            .with_cycle_time(100)
            .with_signal(SignalDefinition::new("Big", 0, 16).with_scaling(1e307, 0.0)),
    );
    let mut engine = SimulationEngine::new(config).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(200);

    assert_eq!(engine.frame_count(0x120), 2);
    assert!(engine.signal_value(0x120, "Big").unwrap().is_finite());
}

#[test]
fn test_cadence_holds_at_extreme_speed() {
    let config = SimConfig::default()
        .with_seed(5)
        .with_jitter_percent(0.0)
        .with_message(MessageDefinition::new(0x110, "Fast", 8).with_cycle_time(10));
    let mut engine = SimulationEngine::new(config).unwrap();
    engine.start(100_000.0).unwrap();
    engine.run_simulated(1_000);

    assert!((engine.now_ms() - 1_000.0).abs() < 1e-3);
    assert!((99..=100).contains(&engine.frame_count(0x110)));
}

#[test]
fn test_speed_outside_supported_range_is_rejected() {
    let mut engine = SimulationEngine::new(config()).unwrap();
    assert!(matches!(engine.start(0.0), Err(EngineError::InvalidSpeed(_))));
    assert!(matches!(engine.start(f64::INFINITY), Err(EngineError::InvalidSpeed(_))));
    assert!(matches!(engine.start(2_000_000.0), Err(EngineError::InvalidSpeed(_))));
    engine.start(1_000_000.0).unwrap();
}

#[test]
fn test_raw_send_needs_a_dlc_length_on_can_fd() {
    let mut engine = SimulationEngine::new(SimConfig::default().with_seed(1).with_can_fd(true)).unwrap();
    engine.start(1.0).unwrap();

    let odd = engine.send_message(SendRequest::Raw {
        id: 0x321,
        data: vec![0; 10],
        extended: false,
    });
    assert!(matches!(odd, Err(EngineError::InvalidPayloadLength(10))));

    for len in [8, 12, 64] {
        engine
            .send_message(SendRequest::Raw {
                id: 0x321,
                data: vec![0; len],
                extended: false,
            })
            .unwrap();
    }
    assert_eq!(engine.frame_count(0x321), 3);
}
