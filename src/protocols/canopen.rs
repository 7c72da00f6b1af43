//! CANopen NMT slave with heartbeat producer and emergency messages.

use super::{FaultFollowUp, OutgoingFrame, ProtocolAction, ProtocolActions, ProtocolBehavior, ProtocolTimer};
use crate::config::CanOpenConfig;
use crate::fault_injection::FaultKind;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const NMT_ID: u32 = 0x000;
pub const EMCY_BASE: u32 = 0x080;
pub const HEARTBEAT_BASE: u32 = 0x700;
/// TPDO1..TPDO4 identifier range, transmitted only while OPERATIONAL.
pub const TPDO_RANGE: core::ops::RangeInclusive<u32> = 0x180..=0x57F;

/// Emergency code for a heartbeat consumer timeout.
pub const EMCY_HEARTBEAT_LOST: u16 = 0x8130;
/// Error register bit 4: communication error.
const ERROR_REGISTER_COMMUNICATION: u8 = 0x11;
const PEER_NODE: &str = "canopen-peer";
const NMT_MASTER_NODE: &str = "nmt-master";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmtState {
    Initializing,
    PreOperational,
    Operational,
    Stopped,
}

impl NmtState {
    /// Byte carried by the heartbeat (and the boot-up message).
    pub fn state_byte(self) -> u8 {
        match self {
            NmtState::Initializing => 0x00,
            NmtState::Stopped => 0x04,
            NmtState::Operational => 0x05,
            NmtState::PreOperational => 0x7F,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NmtCommand {
    Start,
    Stop,
    EnterPreOperational,
    ResetNode,
    ResetCommunication,
}

impl NmtCommand {
    pub fn code(self) -> u8 {
        match self {
            NmtCommand::Start => 0x01,
            NmtCommand::Stop => 0x02,
            NmtCommand::EnterPreOperational => 0x80,
            NmtCommand::ResetNode => 0x81,
            NmtCommand::ResetCommunication => 0x82,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(NmtCommand::Start),
            0x02 => Some(NmtCommand::Stop),
            0x80 => Some(NmtCommand::EnterPreOperational),
            0x81 => Some(NmtCommand::ResetNode),
            0x82 => Some(NmtCommand::ResetCommunication),
            _ => None,
        }
    }
}

/// NMT module control frame; `target` 0 addresses every node.
pub fn nmt_frame(command: NmtCommand, target: u8) -> OutgoingFrame {
    OutgoingFrame::new(NMT_ID, "NMT", NMT_MASTER_NODE, &[command.code(), target])
}

pub fn heartbeat_frame(node_id: u8, state: NmtState, source: &str) -> OutgoingFrame {
    let name = if state == NmtState::Initializing {
        "BootUp"
    } else {
        "Heartbeat"
    };
    OutgoingFrame::new(HEARTBEAT_BASE + u32::from(node_id), name, source, &[state.state_byte()])
}

/// EMCY frame: error code (LE), error register, five manufacturer bytes.
pub fn emergency_frame(node_id: u8, error_code: u16, error_register: u8, source: &str) -> OutgoingFrame {
    let code = error_code.to_le_bytes();
    OutgoingFrame::new(
        EMCY_BASE + u32::from(node_id),
        "EMCY",
        source,
        &[code[0], code[1], error_register, 0, 0, 0, 0, 0],
    )
}

#[derive(Debug)]
pub struct CanOpenNode {
    node_id: u8,
    heartbeat_time_ms: u64,
    auto_start: bool,
    node: String,
    state: NmtState,
    boot_count: u32,
}

impl CanOpenNode {
    pub fn new(config: &CanOpenConfig) -> Self {
        Self {
            node_id: config.node_id,
            heartbeat_time_ms: config.heartbeat_time_ms,
            auto_start: config.auto_start,
            node: config.node.clone(),
            state: NmtState::Initializing,
            boot_count: 0,
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn boot_count(&self) -> u32 {
        self.boot_count
    }

    fn boot(&mut self) -> ProtocolAction {
        self.state = NmtState::Initializing;
        self.boot_count += 1;
        let frame = heartbeat_frame(self.node_id, NmtState::Initializing, &self.node);
        self.state = if self.auto_start {
            NmtState::Operational
        } else {
            NmtState::PreOperational
        };
        info!(node_id = self.node_id, state = ?self.state, "CANopen boot-up");
        ProtocolAction::Emit(frame)
    }

    fn apply(&mut self, command: NmtCommand) -> ProtocolActions {
        debug!(node_id = self.node_id, ?command, "NMT command");
        match command {
            NmtCommand::Start => self.state = NmtState::Operational,
            NmtCommand::Stop => self.state = NmtState::Stopped,
            NmtCommand::EnterPreOperational => self.state = NmtState::PreOperational,
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => return vec![self.boot()],
        }
        ProtocolActions::new()
    }

    fn arm_heartbeat(&self) -> Option<ProtocolAction> {
        (self.heartbeat_time_ms > 0).then(|| ProtocolAction::Arm {
            delay_ms: self.heartbeat_time_ms,
            timer: ProtocolTimer::Heartbeat,
        })
    }
}

impl ProtocolBehavior for CanOpenNode {
    fn start<R: Rng>(&mut self, _rng: &mut R) -> ProtocolActions {
        self.boot_count = 0;
        let mut actions = vec![self.boot()];
        actions.extend(self.arm_heartbeat());
        actions
    }

    fn handle_frame<R: Rng>(&mut self, id: u32, data: &[u8], _rng: &mut R) -> ProtocolActions {
        if id != NMT_ID || data.len() < 2 {
            return ProtocolActions::new();
        }
        let target = data[1];
        if target != 0 && target != self.node_id {
            return ProtocolActions::new();
        }
        match NmtCommand::from_code(data[0]) {
            Some(command) => self.apply(command),
            None => {
                debug!(code = data[0], "Ignoring unknown NMT command");
                ProtocolActions::new()
            }
        }
    }

    fn handle_timer<R: Rng>(&mut self, timer: ProtocolTimer, _rng: &mut R) -> ProtocolActions {
        if timer != ProtocolTimer::Heartbeat {
            return ProtocolActions::new();
        }
        let mut actions = ProtocolActions::new();
        if self.state != NmtState::Initializing {
            actions.push(ProtocolAction::Emit(heartbeat_frame(self.node_id, self.state, &self.node)));
        }
        actions.extend(self.arm_heartbeat());
        actions
    }

    fn fault_follow_up<R: Rng>(&mut self, kind: FaultKind, _rng: &mut R) -> FaultFollowUp {
        if kind != FaultKind::HeartbeatLost {
            return FaultFollowUp::Unsupported;
        }
        // Reported by a neighbour that stopped hearing us.
        let peer = (self.node_id % 127) + 1;
        FaultFollowUp::Frame {
            frame: emergency_frame(peer, EMCY_HEARTBEAT_LOST, ERROR_REGISTER_COMMUNICATION, PEER_NODE),
            deliver: false,
        }
    }

    fn permits(&self, message_id: u32) -> bool {
        !TPDO_RANGE.contains(&message_id) || self.state == NmtState::Operational
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node(auto_start: bool) -> CanOpenNode {
        CanOpenNode::new(&CanOpenConfig {
            node_id: 5,
            heartbeat_time_ms: 1000,
            auto_start,
            node: "ecu".to_string(),
        })
    }

    #[test]
    fn test_boot_up_then_operational() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut n = node(true);
        let actions = n.start(&mut rng);
        assert_eq!(
            actions[0],
            ProtocolAction::Emit(OutgoingFrame::new(0x705, "BootUp", "ecu", &[0x00]))
        );
        assert_eq!(
            actions[1],
            ProtocolAction::Arm {
                delay_ms: 1000,
                timer: ProtocolTimer::Heartbeat
            }
        );
        assert_eq!(n.state(), NmtState::Operational);
    }

    #[test]
    fn test_without_auto_start_waits_in_pre_operational() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut n = node(false);
        n.start(&mut rng);
        assert_eq!(n.state(), NmtState::PreOperational);
        assert!(!n.permits(0x185));
        assert!(n.permits(0x100));

        n.handle_frame(NMT_ID, &[0x01, 5], &mut rng);
        assert_eq!(n.state(), NmtState::Operational);
        assert!(n.permits(0x185));
    }

    #[test]
    fn test_nmt_addressing() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut n = node(true);
        n.start(&mut rng);

        n.handle_frame(NMT_ID, &[0x02, 6], &mut rng);
        assert_eq!(n.state(), NmtState::Operational);
        n.handle_frame(NMT_ID, &[0x02, 0], &mut rng);
        assert_eq!(n.state(), NmtState::Stopped);
        n.handle_frame(NMT_ID, &[0x42, 0], &mut rng);
        assert_eq!(n.state(), NmtState::Stopped);
    }

    #[test]
    fn test_heartbeat_carries_state_byte() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut n = node(true);
        n.start(&mut rng);
        n.handle_frame(NMT_ID, &[0x80, 5], &mut rng);

        let actions = n.handle_timer(ProtocolTimer::Heartbeat, &mut rng);
        match &actions[0] {
            ProtocolAction::Emit(frame) => {
                assert_eq!(frame.id, 0x705);
                assert_eq!(frame.data.as_slice(), &[0x7F]);
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(matches!(actions[1], ProtocolAction::Arm { delay_ms: 1000, .. }));
    }

    #[test]
    fn test_reset_re_emits_boot_up() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut n = node(true);
        n.start(&mut rng);
        let actions = n.handle_frame(NMT_ID, &[0x81, 5], &mut rng);
        assert_eq!(
            actions,
            vec![ProtocolAction::Emit(OutgoingFrame::new(0x705, "BootUp", "ecu", &[0x00]))]
        );
        assert_eq!(n.boot_count(), 2);
    }

    #[test]
    fn test_heartbeat_lost_reports_from_peer() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut n = CanOpenNode::new(&CanOpenConfig {
            node_id: 127,
            ..CanOpenConfig::default()
        });
        match n.fault_follow_up(FaultKind::HeartbeatLost, &mut rng) {
            FaultFollowUp::Frame { frame, deliver } => {
                assert!(!deliver);
                assert_eq!(frame.id, 0x081);
                assert_eq!(frame.data.as_slice(), &[0x30, 0x81, 0x11, 0, 0, 0, 0, 0]);
            }
            other => panic!("unexpected follow-up {:?}", other),
        }
    }
}
