use cansim::config::{CanOpenConfig, J1939Config, PgnDefinition, SpnDefinition, UdsConfig};
use cansim::protocols::canopen::{NmtCommand, NmtState};
use cansim::protocols::j1939::{AddressClaimState, J1939Name};
use cansim::*;

fn j1939_config() -> SimConfig {
    SimConfig::new(ProtocolConfig::J1939(J1939Config {
        preferred_address: 0x80,
        name: J1939Name {
            identity_number: 100,
            ..J1939Name::default()
        },
        claim_timeout_ms: 250,
        node: "engine".to_string(),
        pgns: vec![PgnDefinition {
            pgn: 65262,
            name: "ET1".to_string(),
            priority: 6,
            length: 8,
            cycle_time_ms: 0,
            destination: None,
            spns: vec![SpnDefinition {
                spn: 110,
                signal: SignalDefinition::new("CoolantTemp", 0, 8).with_scaling(1.0, -40.0),
            }],
        }],
    }))
    .with_seed(5)
    .with_jitter_percent(0.0)
}

fn claimed_j1939() -> SimulationEngine {
    let mut engine = SimulationEngine::new(j1939_config()).unwrap();
    engine.start(1.0).unwrap();
    engine.run_simulated(600);
    engine
}

#[test]
fn test_j1939_claim_sequence() {
    let engine = claimed_j1939();
    assert_eq!(engine.j1939_state(), Some(AddressClaimState::Claimed));

    let ids: Vec<u32> = engine.history().iter().map(|f| f.id).collect();
    assert_eq!(ids, vec![0x18EA_FFFE, 0x18EE_FF80]);
    let claim = engine.history().latest().unwrap();
    assert!(claim.extended);
    assert_eq!(claim.data, 100u64.to_le_bytes().to_vec());
    assert_eq!(claim.source, "engine");
}

#[test]
fn test_j1939_pgn_table_becomes_messages() {
    let engine = SimulationEngine::new(j1939_config()).unwrap();
    let et1 = engine.message(0x18FE_EE80).unwrap();
    assert_eq!(et1.name, "ET1");
    assert!(et1.extended);
    assert_eq!(et1.signals.len(), 1);
}

#[test]
fn test_j1939_lower_name_takes_our_address() {
    let mut engine = claimed_j1939();
    engine.drain_events();

    engine
        .send_message(SendRequest::Raw {
            id: 0x18EE_FF80,
            data: 1u64.to_le_bytes().to_vec(),
            extended: true,
        })
        .unwrap();

    assert_eq!(engine.j1939_state(), Some(AddressClaimState::CannotClaim));
    let frames = engine.drain_events();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].id, 0x18EE_FFFE);
    assert_eq!(frames[1].name, "CannotClaimAddress");

    // Once silenced, requests for PGN-table groups go unanswered.
    engine
        .send_message(SendRequest::J1939Request {
            pgn: 65262,
            destination: 0xFF,
        })
        .unwrap();
    assert_eq!(engine.frame_count(0x18FE_EE80), 0);
}

#[test]
fn test_j1939_higher_name_is_defended() {
    let mut engine = claimed_j1939();
    engine.drain_events();

    engine
        .send_message(SendRequest::Raw {
            id: 0x18EE_FF80,
            data: u64::MAX.to_le_bytes().to_vec(),
            extended: true,
        })
        .unwrap();

    assert_eq!(engine.j1939_state(), Some(AddressClaimState::Claimed));
    let frames = engine.drain_events();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].id, 0x18EE_FF80);
    assert_eq!(frames[1].data, 100u64.to_le_bytes().to_vec());
    assert_eq!(engine.protocol().j1939().unwrap().contentions(), 1);
}

#[test]
fn test_j1939_request_transmits_group() {
    let mut engine = claimed_j1939();
    engine
        .send_message(SendRequest::J1939Request {
            pgn: 65262,
            destination: 0xFF,
        })
        .unwrap();

    assert_eq!(engine.frame_count(0x18EA_FFF9), 1);
    assert_eq!(engine.frame_count(0x18FE_EE80), 1);
    let response = engine.history().latest().unwrap();
    assert_eq!(response.name, "ET1");
    assert!(response.signal("CoolantTemp").is_some());
}

fn canopen_config(auto_start: bool) -> SimConfig {
    SimConfig::new(ProtocolConfig::CanOpen(CanOpenConfig {
        node_id: 5,
        heartbeat_time_ms: 1000,
        auto_start,
        node: "io".to_string(),
    }))
    .with_seed(2)
    .with_jitter_percent(0.0)
}

#[test]
fn test_canopen_heartbeats_at_speed() {
    let mut engine = SimulationEngine::new(canopen_config(true)).unwrap();
    engine.start(10.0).unwrap();
    engine.run_simulated(5_000);

    let frames: Vec<FrameEvent> = engine.drain_events().into_iter().filter(|f| f.id == 0x705).collect();
    assert!(frames.len() >= 4);
    assert_eq!(frames[0].name, "BootUp");
    assert_eq!(frames[0].data, vec![0x00]);
    for heartbeat in &frames[1..] {
        assert_eq!(heartbeat.name, "Heartbeat");
        assert_eq!(heartbeat.data, vec![0x05]);
    }
}

#[test]
fn test_canopen_nmt_state_changes_show_in_heartbeat() {
    let mut engine = SimulationEngine::new(canopen_config(false)).unwrap();
    engine.start(1.0).unwrap();
    assert_eq!(engine.nmt_state(), Some(NmtState::PreOperational));
    engine.run_simulated(1_000);
    assert_eq!(engine.history().latest().unwrap().data, vec![0x7F]);

    engine
        .send_message(SendRequest::Nmt {
            command: NmtCommand::Stop,
            node_id: 0,
        })
        .unwrap();
    assert_eq!(engine.nmt_state(), Some(NmtState::Stopped));
    engine.run_simulated(1_000);
    assert_eq!(engine.history().latest().unwrap().data, vec![0x04]);

    // Commands for other nodes are ignored.
    engine
        .send_message(SendRequest::Nmt {
            command: NmtCommand::Start,
            node_id: 9,
        })
        .unwrap();
    assert_eq!(engine.nmt_state(), Some(NmtState::Stopped));
}

#[test]
fn test_canopen_reset_emits_boot_up() {
    let mut engine = SimulationEngine::new(canopen_config(true)).unwrap();
    engine.start(1.0).unwrap();
    engine.drain_events();

    engine
        .send_message(SendRequest::Nmt {
            command: NmtCommand::ResetNode,
            node_id: 5,
        })
        .unwrap();
    let frames = engine.drain_events();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].id, 0x000);
    assert_eq!(frames[0].data, vec![0x81, 0x05]);
    assert_eq!(frames[1].id, 0x705);
    assert_eq!(frames[1].name, "BootUp");
    assert_eq!(engine.nmt_state(), Some(NmtState::Operational));
    assert_eq!(engine.protocol().canopen().unwrap().boot_count(), 2);
}

fn uds_engine() -> SimulationEngine {
    let mut uds = UdsConfig::default();
    uds.did_values.insert(0xF190, b"WVW1".to_vec());
    let config = SimConfig::new(ProtocolConfig::Uds(uds)).with_seed(4);
    let mut engine = SimulationEngine::new(config).unwrap();
    engine.start(1.0).unwrap();
    engine
}

#[test]
fn test_uds_session_control_response() {
    let mut engine = uds_engine();
    engine
        .send_message(SendRequest::Uds {
            service: 0x10,
            data: vec![0x03],
        })
        .unwrap();

    let request = engine.drain_events();
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].id, 0x7E0);
    assert_eq!(request[0].data, vec![0x02, 0x10, 0x03]);

    engine.run_simulated(40);
    assert!(engine.drain_events().is_empty());
    engine.run_simulated(20);
    let response = engine.drain_events();
    assert_eq!(response.len(), 1);
    assert_eq!(response[0].id, 0x7E8);
    assert_eq!(response[0].data, vec![0x06, 0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
}

#[test]
fn test_uds_read_configured_identifier() {
    let mut engine = uds_engine();
    engine
        .send_message(SendRequest::Uds {
            service: 0x22,
            data: vec![0xF1, 0x90],
        })
        .unwrap();
    engine.run_simulated(100);

    let response = engine.history().latest().unwrap();
    assert_eq!(response.id, 0x7E8);
    assert_eq!(response.data, vec![0x07, 0x62, 0xF1, 0x90, b'W', b'V', b'W', b'1']);
}

#[test]
fn test_uds_timeout_fault_swallows_response() {
    let mut engine = uds_engine();
    engine
        .send_message(SendRequest::Uds {
            service: 0x10,
            data: vec![0x03],
        })
        .unwrap();
    engine.inject_error("timeout").unwrap();
    engine.run_simulated(500);

    assert_eq!(engine.frame_count(0x7E8), 0);
    let uds = engine.protocol().uds().unwrap();
    assert_eq!(uds.responses_dropped(), 1);
    assert_eq!(uds.responses_sent(), 0);

    // The next request is answered normally.
    engine
        .send_message(SendRequest::Uds {
            service: 0x3E,
            data: vec![0x00],
        })
        .unwrap();
    engine.run_simulated(100);
    assert_eq!(engine.frame_count(0x7E8), 1);
}

#[test]
fn test_protocol_requests_need_matching_session() {
    let mut engine = uds_engine();
    let result = engine.send_message(SendRequest::J1939Request {
        pgn: 65262,
        destination: 0xFF,
    });
    assert!(matches!(
        result,
        Err(EngineError::ProtocolMismatch {
            expected: ProtocolKind::J1939,
            actual: ProtocolKind::Uds,
            ..
        })
    ));
}

fn bridge(from: &mut SimulationEngine, to: &mut SimulationEngine) {
    for frame in from.drain_events() {
        // Frames forwarded from the other side come back as "external".
        if frame.source == "external" {
            continue;
        }
        to.send_message(SendRequest::Raw {
            id: frame.id,
            data: frame.data,
            extended: frame.extended,
        })
        .unwrap();
    }
}

#[test]
fn test_j1939_two_controllers_contend_for_one_address() {
    let controller = |identity: u32| {
        let mut config = j1939_config();
        if let ProtocolConfig::J1939(j1939) = &mut config.protocol {
            j1939.name.identity_number = identity;
            j1939.pgns.clear();
        }
        let mut engine = SimulationEngine::new(config).unwrap();
        engine.start(1.0).unwrap();
        engine
    };
    let mut winner = controller(1);
    let mut loser = controller(100);

    for _ in 0..100 {
        winner.run_simulated(10);
        loser.run_simulated(10);
        bridge(&mut winner, &mut loser);
        bridge(&mut loser, &mut winner);
    }

    assert_eq!(winner.j1939_state(), Some(AddressClaimState::Claimed));
    assert_eq!(winner.protocol().j1939().unwrap().claimed_address(), Some(0x80));
    assert_eq!(loser.j1939_state(), Some(AddressClaimState::CannotClaim));
    let cannot_claim = loser
        .history()
        .iter()
        .filter(|f| f.source == "engine")
        .last()
        .unwrap();
    assert_eq!(cannot_claim.id, 0x18EE_FFFE);
}
