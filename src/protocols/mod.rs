pub mod canopen;
pub mod j1939;
pub mod uds;

pub use canopen::{CanOpenNode, NmtCommand, NmtState};
pub use j1939::{AddressClaimState, J1939Controller, J1939Id, J1939Name};
pub use uds::UdsResponder;

use crate::config::{ProtocolConfig, ProtocolKind};
use crate::fault_injection::FaultKind;
use crate::message::MAX_CLASSIC_PAYLOAD_LEN;
use arrayvec::ArrayVec;
use rand::Rng;

pub type ClassicPayload = ArrayVec<u8, MAX_CLASSIC_PAYLOAD_LEN>;

/// A classic frame built by a protocol module, not yet stamped with a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub id: u32,
    pub extended: bool,
    pub name: &'static str,
    pub source: String,
    pub data: ClassicPayload,
}

impl OutgoingFrame {
    /// Bytes beyond the classic eight are dropped.
    pub fn new(id: u32, name: &'static str, source: &str, data: &[u8]) -> Self {
        let len = data.len().min(MAX_CLASSIC_PAYLOAD_LEN);
        let mut payload = ClassicPayload::new();
        // Cannot fail: `len` is within capacity.
        let _ = payload.try_extend_from_slice(&data[..len]);
        Self {
            id,
            extended: false,
            name,
            source: source.to_string(),
            data: payload,
        }
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolTimer {
    ClaimTimeout { generation: u32 },
    Heartbeat,
    UdsResponse { generation: u32, frame: OutgoingFrame },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolAction {
    /// Put a frame on the bus now.
    Emit(OutgoingFrame),
    /// Call back into the module after `delay_ms` of simulated time.
    Arm { delay_ms: u64, timer: ProtocolTimer },
    /// Compose and transmit a registered message immediately.
    Transmit(u32),
}

pub type ProtocolActions = Vec<ProtocolAction>;

/// What a protocol-specific fault adds after the generic error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultFollowUp {
    /// Emit `frame` after the follow-up delay; when `deliver` is set the frame
    /// is also handed back to the protocol module as if received.
    Frame { frame: OutgoingFrame, deliver: bool },
    /// The fault is modelled by emitting nothing.
    Silence,
    /// The fault does not belong to this protocol.
    Unsupported,
}

/// Reactive behaviour of one higher-layer protocol. Modules never touch the
/// clock or the bus directly; they return actions for the engine to apply.
pub trait ProtocolBehavior {
    fn start<R: Rng>(&mut self, rng: &mut R) -> ProtocolActions;

    fn handle_frame<R: Rng>(&mut self, id: u32, data: &[u8], rng: &mut R) -> ProtocolActions;

    fn handle_timer<R: Rng>(&mut self, timer: ProtocolTimer, rng: &mut R) -> ProtocolActions;

    fn fault_follow_up<R: Rng>(&mut self, _kind: FaultKind, _rng: &mut R) -> FaultFollowUp {
        FaultFollowUp::Unsupported
    }

    /// Whether the periodic message `message_id` may be transmitted in the
    /// current protocol state.
    fn permits(&self, _message_id: u32) -> bool {
        true
    }
}

/// The protocol module selected for a session.
#[derive(Debug)]
pub enum ProtocolStack {
    Can,
    J1939(J1939Controller),
    CanOpen(CanOpenNode),
    Uds(UdsResponder),
}

impl ProtocolStack {
    pub fn from_config(config: &ProtocolConfig) -> Self {
        match config {
            ProtocolConfig::Can => ProtocolStack::Can,
            ProtocolConfig::J1939(c) => ProtocolStack::J1939(J1939Controller::new(c)),
            ProtocolConfig::CanOpen(c) => ProtocolStack::CanOpen(CanOpenNode::new(c)),
            ProtocolConfig::Uds(c) => ProtocolStack::Uds(UdsResponder::new(c)),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolStack::Can => ProtocolKind::Can,
            ProtocolStack::J1939(_) => ProtocolKind::J1939,
            ProtocolStack::CanOpen(_) => ProtocolKind::CanOpen,
            ProtocolStack::Uds(_) => ProtocolKind::Uds,
        }
    }

    pub fn start<R: Rng>(&mut self, rng: &mut R) -> ProtocolActions {
        match self {
            ProtocolStack::Can => ProtocolActions::new(),
            ProtocolStack::J1939(p) => p.start(rng),
            ProtocolStack::CanOpen(p) => p.start(rng),
            ProtocolStack::Uds(p) => p.start(rng),
        }
    }

    pub fn handle_frame<R: Rng>(&mut self, id: u32, data: &[u8], rng: &mut R) -> ProtocolActions {
        match self {
            ProtocolStack::Can => ProtocolActions::new(),
            ProtocolStack::J1939(p) => p.handle_frame(id, data, rng),
            ProtocolStack::CanOpen(p) => p.handle_frame(id, data, rng),
            ProtocolStack::Uds(p) => p.handle_frame(id, data, rng),
        }
    }

    pub fn handle_timer<R: Rng>(&mut self, timer: ProtocolTimer, rng: &mut R) -> ProtocolActions {
        match self {
            ProtocolStack::Can => ProtocolActions::new(),
            ProtocolStack::J1939(p) => p.handle_timer(timer, rng),
            ProtocolStack::CanOpen(p) => p.handle_timer(timer, rng),
            ProtocolStack::Uds(p) => p.handle_timer(timer, rng),
        }
    }

    pub fn fault_follow_up<R: Rng>(&mut self, kind: FaultKind, rng: &mut R) -> FaultFollowUp {
        match self {
            ProtocolStack::Can => FaultFollowUp::Unsupported,
            ProtocolStack::J1939(p) => p.fault_follow_up(kind, rng),
            ProtocolStack::CanOpen(p) => p.fault_follow_up(kind, rng),
            ProtocolStack::Uds(p) => p.fault_follow_up(kind, rng),
        }
    }

    pub fn permits(&self, message_id: u32) -> bool {
        match self {
            ProtocolStack::Can => true,
            ProtocolStack::J1939(p) => p.permits(message_id),
            ProtocolStack::CanOpen(p) => p.permits(message_id),
            ProtocolStack::Uds(p) => p.permits(message_id),
        }
    }

    pub fn j1939(&self) -> Option<&J1939Controller> {
        match self {
            ProtocolStack::J1939(p) => Some(p),
            _ => None,
        }
    }

    pub fn canopen(&self) -> Option<&CanOpenNode> {
        match self {
            ProtocolStack::CanOpen(p) => Some(p),
            _ => None,
        }
    }

    pub fn uds(&self) -> Option<&UdsResponder> {
        match self {
            ProtocolStack::Uds(p) => Some(p),
            _ => None,
        }
    }
}
