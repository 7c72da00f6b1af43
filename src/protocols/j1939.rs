//! SAE J1939 identifier packing and address claiming.
//!
//! The controller claims `preferred_address` on start: it first asks the bus
//! for existing claims (Request for Address Claimed from the null address),
//! waits one claim timeout, asserts its own claim and waits a second timeout
//! before considering the address owned. A contending claim on the same
//! address is arbitrated by NAME, the numerically smaller NAME wins.

use super::{FaultFollowUp, OutgoingFrame, ProtocolAction, ProtocolActions, ProtocolBehavior, ProtocolTimer};
use crate::config::{ConfigError, J1939Config};
use crate::fault_injection::FaultKind;
use crate::message::{MessageDefinition, MAX_STANDARD_ID};
use rand::Rng;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::{debug, info, warn};

pub const PGN_REQUEST: u32 = 0xEA00;
pub const PGN_ADDRESS_CLAIMED: u32 = 0xEE00;
/// Source address of a node that has not (or could not) claim an address.
pub const NULL_ADDRESS: u8 = 254;
pub const GLOBAL_ADDRESS: u8 = 255;
pub const DEFAULT_PRIORITY: u8 = 6;

const PDU2_FORMAT_START: u32 = 240;
const PGN_MASK: u32 = 0x3_FFFF;
const PEER_NODE: &str = "j1939-peer";

const PRIORITY_BITS: u32 = 3;
const PGN_BITS: u32 = 18;
const SOURCE_ADDRESS_BITS: u32 = 8;
const_assert_eq!(PRIORITY_BITS + PGN_BITS + SOURCE_ADDRESS_BITS, 29);

// NAME fields, least significant first.
const IDENTITY_BITS: u32 = 21;
const MANUFACTURER_BITS: u32 = 11;
const ECU_INSTANCE_BITS: u32 = 3;
const FUNCTION_INSTANCE_BITS: u32 = 5;
const FUNCTION_BITS: u32 = 8;
const RESERVED_BITS: u32 = 1;
const VEHICLE_SYSTEM_BITS: u32 = 7;
const VEHICLE_SYSTEM_INSTANCE_BITS: u32 = 4;
const INDUSTRY_GROUP_BITS: u32 = 3;
const ARBITRARY_ADDRESS_BITS: u32 = 1;
const_assert_eq!(
    IDENTITY_BITS
        + MANUFACTURER_BITS
        + ECU_INSTANCE_BITS
        + FUNCTION_INSTANCE_BITS
        + FUNCTION_BITS
        + RESERVED_BITS
        + VEHICLE_SYSTEM_BITS
        + VEHICLE_SYSTEM_INSTANCE_BITS
        + INDUSTRY_GROUP_BITS
        + ARBITRARY_ADDRESS_BITS,
    64
);

const MANUFACTURER_SHIFT: u32 = IDENTITY_BITS;
const ECU_INSTANCE_SHIFT: u32 = MANUFACTURER_SHIFT + MANUFACTURER_BITS;
const FUNCTION_INSTANCE_SHIFT: u32 = ECU_INSTANCE_SHIFT + ECU_INSTANCE_BITS;
const FUNCTION_SHIFT: u32 = FUNCTION_INSTANCE_SHIFT + FUNCTION_INSTANCE_BITS;
const RESERVED_SHIFT: u32 = FUNCTION_SHIFT + FUNCTION_BITS;
const VEHICLE_SYSTEM_SHIFT: u32 = RESERVED_SHIFT + RESERVED_BITS;
const VEHICLE_SYSTEM_INSTANCE_SHIFT: u32 = VEHICLE_SYSTEM_SHIFT + VEHICLE_SYSTEM_BITS;
const INDUSTRY_GROUP_SHIFT: u32 = VEHICLE_SYSTEM_INSTANCE_SHIFT + VEHICLE_SYSTEM_INSTANCE_BITS;
const ARBITRARY_ADDRESS_SHIFT: u32 = INDUSTRY_GROUP_SHIFT + INDUSTRY_GROUP_BITS;

fn field_mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

fn extract(raw: u64, shift: u32, bits: u32) -> u64 {
    (raw >> shift) & field_mask(bits)
}

/// The 64-bit J1939 NAME, kept as separate fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct J1939Name {
    pub identity_number: u32,
    pub manufacturer_code: u16,
    pub ecu_instance: u8,
    pub function_instance: u8,
    pub function: u8,
    pub reserved: bool,
    pub vehicle_system: u8,
    pub vehicle_system_instance: u8,
    pub industry_group: u8,
    pub arbitrary_address_capable: bool,
}

impl J1939Name {
    /// (field name, value, width, shift) in bit order.
    fn fields(&self) -> [(&'static str, u64, u32, u32); 10] {
        [
            ("identity_number", u64::from(self.identity_number), IDENTITY_BITS, 0),
            ("manufacturer_code", u64::from(self.manufacturer_code), MANUFACTURER_BITS, MANUFACTURER_SHIFT),
            ("ecu_instance", u64::from(self.ecu_instance), ECU_INSTANCE_BITS, ECU_INSTANCE_SHIFT),
            ("function_instance", u64::from(self.function_instance), FUNCTION_INSTANCE_BITS, FUNCTION_INSTANCE_SHIFT),
            ("function", u64::from(self.function), FUNCTION_BITS, FUNCTION_SHIFT),
            ("reserved", u64::from(self.reserved), RESERVED_BITS, RESERVED_SHIFT),
            ("vehicle_system", u64::from(self.vehicle_system), VEHICLE_SYSTEM_BITS, VEHICLE_SYSTEM_SHIFT),
            (
                "vehicle_system_instance",
                u64::from(self.vehicle_system_instance),
                VEHICLE_SYSTEM_INSTANCE_BITS,
                VEHICLE_SYSTEM_INSTANCE_SHIFT,
            ),
            ("industry_group", u64::from(self.industry_group), INDUSTRY_GROUP_BITS, INDUSTRY_GROUP_SHIFT),
            (
                "arbitrary_address_capable",
                u64::from(self.arbitrary_address_capable),
                ARBITRARY_ADDRESS_BITS,
                ARBITRARY_ADDRESS_SHIFT,
            ),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value, bits, _) in self.fields() {
            if value > field_mask(bits) {
                return Err(ConfigError::NameFieldOutOfRange { field, value, bits });
            }
        }
        Ok(())
    }

    /// Pack into the wire value. Oversized fields are truncated to their
    /// width.
    pub fn to_u64(&self) -> u64 {
        self.fields()
            .iter()
            .fold(0u64, |acc, (_, value, bits, shift)| acc | ((value & field_mask(*bits)) << shift))
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            identity_number: extract(raw, 0, IDENTITY_BITS) as u32,
            manufacturer_code: extract(raw, MANUFACTURER_SHIFT, MANUFACTURER_BITS) as u16,
            ecu_instance: extract(raw, ECU_INSTANCE_SHIFT, ECU_INSTANCE_BITS) as u8,
            function_instance: extract(raw, FUNCTION_INSTANCE_SHIFT, FUNCTION_INSTANCE_BITS) as u8,
            function: extract(raw, FUNCTION_SHIFT, FUNCTION_BITS) as u8,
            reserved: extract(raw, RESERVED_SHIFT, RESERVED_BITS) == 1,
            vehicle_system: extract(raw, VEHICLE_SYSTEM_SHIFT, VEHICLE_SYSTEM_BITS) as u8,
            vehicle_system_instance: extract(raw, VEHICLE_SYSTEM_INSTANCE_SHIFT, VEHICLE_SYSTEM_INSTANCE_BITS)
                as u8,
            industry_group: extract(raw, INDUSTRY_GROUP_SHIFT, INDUSTRY_GROUP_BITS) as u8,
            arbitrary_address_capable: extract(raw, ARBITRARY_ADDRESS_SHIFT, ARBITRARY_ADDRESS_BITS) == 1,
        }
    }
}

fn pdu_format(pgn: u32) -> u32 {
    (pgn >> 8) & 0xFF
}

/// A decoded 29-bit J1939 identifier. `destination` is only present for PDU1
/// parameter groups, where it occupies the PDU-specific byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct J1939Id {
    pub priority: u8,
    pub pgn: u32,
    pub source: u8,
    pub destination: Option<u8>,
}

impl J1939Id {
    pub fn new(priority: u8, pgn: u32, source: u8) -> Self {
        let pgn = pgn & PGN_MASK;
        let destination = Self::is_pdu1(pgn).then_some(GLOBAL_ADDRESS);
        let pgn = if destination.is_some() { pgn & !0xFF } else { pgn };
        Self {
            priority: priority & 0x07,
            pgn,
            source,
            destination,
        }
    }

    /// Set the destination of a PDU1 group; PDU2 groups are always broadcast.
    pub fn to(mut self, destination: u8) -> Self {
        if self.destination.is_some() {
            self.destination = Some(destination);
        }
        self
    }

    pub fn is_pdu1(pgn: u32) -> bool {
        pdu_format(pgn) < PDU2_FORMAT_START
    }

    pub fn encode(&self) -> u32 {
        let pdu_specific = match self.destination {
            Some(destination) => u32::from(destination),
            None => self.pgn & 0xFF,
        };
        let pgn_field = (self.pgn & !0xFF & PGN_MASK) | pdu_specific;
        (u32::from(self.priority & 0x07) << (PGN_BITS + SOURCE_ADDRESS_BITS))
            | (pgn_field << SOURCE_ADDRESS_BITS)
            | u32::from(self.source)
    }

    pub fn decode(id: u32) -> Self {
        let priority = ((id >> (PGN_BITS + SOURCE_ADDRESS_BITS)) & 0x07) as u8;
        let pgn_field = (id >> SOURCE_ADDRESS_BITS) & PGN_MASK;
        let source = (id & 0xFF) as u8;
        if Self::is_pdu1(pgn_field) {
            Self {
                priority,
                pgn: pgn_field & !0xFF,
                source,
                destination: Some((pgn_field & 0xFF) as u8),
            }
        } else {
            Self {
                priority,
                pgn: pgn_field,
                source,
                destination: None,
            }
        }
    }

    /// True when the frame is addressed to everyone or to `address`.
    pub fn is_for(&self, address: Option<u8>) -> bool {
        match self.destination {
            None | Some(GLOBAL_ADDRESS) => true,
            Some(destination) => Some(destination) == address,
        }
    }
}

/// Address Claimed (or Cannot Claim, when sent from the null address)
/// carrying `name`.
pub fn address_claimed_frame(name: u64, source_address: u8, source: &str) -> OutgoingFrame {
    let id = J1939Id::new(DEFAULT_PRIORITY, PGN_ADDRESS_CLAIMED, source_address).encode();
    let label = if source_address == NULL_ADDRESS {
        "CannotClaimAddress"
    } else {
        "AddressClaimed"
    };
    OutgoingFrame::new(id, label, source, &name.to_le_bytes()).extended()
}

/// Request PGN (0xEA00) asking `destination` for `requested_pgn`.
pub fn request_frame(requested_pgn: u32, source_address: u8, destination: u8, source: &str) -> OutgoingFrame {
    let id = J1939Id::new(DEFAULT_PRIORITY, PGN_REQUEST, source_address)
        .to(destination)
        .encode();
    let pgn = requested_pgn.to_le_bytes();
    OutgoingFrame::new(id, "Request", source, &pgn[..3]).extended()
}

/// Message definitions for the configured PGN table, sourced from the
/// preferred address.
pub fn derived_messages(config: &J1939Config) -> Vec<MessageDefinition> {
    config
        .pgns
        .iter()
        .map(|group| {
            let mut id = J1939Id::new(group.priority, group.pgn, config.preferred_address);
            if let Some(destination) = group.destination {
                id = id.to(destination);
            }
            let name = if group.name.is_empty() {
                format!("PGN_{}", group.pgn)
            } else {
                group.name.clone()
            };
            let mut message = MessageDefinition::new(id.encode(), &name, group.length)
                .with_cycle_time(group.cycle_time_ms)
                .with_node(&config.node);
            message.extended = true;
            message.signals = group.spns.iter().map(|spn| spn.signal.clone()).collect();
            message
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressClaimState {
    Idle,
    /// Request for Address Claimed sent, collecting existing claims.
    WaitClaimResponse,
    /// Own claim sent, waiting for contention.
    WaitClaimTimeout,
    Claimed,
    /// Lost arbitration; transmits nothing but Cannot Claim.
    CannotClaim,
}

#[derive(Debug)]
pub struct J1939Controller {
    preferred_address: u8,
    name: u64,
    claim_timeout_ms: u64,
    node: String,
    state: AddressClaimState,
    claimed_address: Option<u8>,
    generation: u32,
    /// (PGN, message id) for every group in the PGN table.
    pgn_messages: Vec<(u32, u32)>,
    contentions: u32,
}

impl J1939Controller {
    pub fn new(config: &J1939Config) -> Self {
        let pgn_messages = config
            .pgns
            .iter()
            .zip(derived_messages(config))
            .map(|(group, message)| (group.pgn & PGN_MASK, message.id))
            .collect();
        Self {
            preferred_address: config.preferred_address,
            name: config.name.to_u64(),
            claim_timeout_ms: config.claim_timeout_ms,
            node: config.node.clone(),
            state: AddressClaimState::Idle,
            claimed_address: None,
            generation: 0,
            pgn_messages,
            contentions: 0,
        }
    }

    pub fn state(&self) -> AddressClaimState {
        self.state
    }

    pub fn claimed_address(&self) -> Option<u8> {
        self.claimed_address
    }

    pub fn preferred_address(&self) -> u8 {
        self.preferred_address
    }

    pub fn name(&self) -> u64 {
        self.name
    }

    /// Number of competing claims seen for our address.
    pub fn contentions(&self) -> u32 {
        self.contentions
    }

    /// The address a competing claim has to match to contend with us.
    fn contested_address(&self) -> u8 {
        self.claimed_address.unwrap_or(self.preferred_address)
    }

    fn arm_claim_timeout(&self) -> ProtocolAction {
        ProtocolAction::Arm {
            delay_ms: self.claim_timeout_ms,
            timer: ProtocolTimer::ClaimTimeout {
                generation: self.generation,
            },
        }
    }

    fn own_claim(&self) -> OutgoingFrame {
        let address = if self.state == AddressClaimState::CannotClaim {
            NULL_ADDRESS
        } else {
            self.contested_address()
        };
        address_claimed_frame(self.name, address, &self.node)
    }

    fn arbitrate(&mut self, source_address: u8, other_name: u64) -> ProtocolActions {
        if matches!(self.state, AddressClaimState::Idle | AddressClaimState::CannotClaim) {
            return ProtocolActions::new();
        }
        if source_address != self.contested_address() || other_name == self.name {
            return ProtocolActions::new();
        }

        self.contentions += 1;
        if self.name < other_name {
            debug!(
                address = source_address,
                ours = self.name,
                theirs = other_name,
                "Won address arbitration, re-asserting claim"
            );
            vec![ProtocolAction::Emit(self.own_claim())]
        } else {
            warn!(
                address = source_address,
                theirs = other_name,
                "Lost address arbitration, cannot claim"
            );
            self.state = AddressClaimState::CannotClaim;
            self.claimed_address = None;
            // Outstanding claim timers must not revive the claim.
            self.generation = self.generation.wrapping_add(1);
            vec![ProtocolAction::Emit(self.own_claim())]
        }
    }

    fn handle_request(&self, id: J1939Id, data: &[u8]) -> ProtocolActions {
        if data.len() < 3 || !id.is_for(self.claimed_address) {
            return ProtocolActions::new();
        }
        let requested = u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16);

        if requested == PGN_ADDRESS_CLAIMED {
            return match self.state {
                AddressClaimState::Idle => ProtocolActions::new(),
                _ => vec![ProtocolAction::Emit(self.own_claim())],
            };
        }
        if self.state == AddressClaimState::CannotClaim {
            return ProtocolActions::new();
        }
        self.pgn_messages
            .iter()
            .filter(|(pgn, _)| *pgn == requested)
            .map(|(_, message_id)| ProtocolAction::Transmit(*message_id))
            .collect()
    }
}

impl ProtocolBehavior for J1939Controller {
    fn start<R: Rng>(&mut self, _rng: &mut R) -> ProtocolActions {
        self.generation = self.generation.wrapping_add(1);
        self.state = AddressClaimState::WaitClaimResponse;
        self.claimed_address = None;
        info!(address = self.preferred_address, "Starting J1939 address claim");
        vec![
            ProtocolAction::Emit(request_frame(PGN_ADDRESS_CLAIMED, NULL_ADDRESS, GLOBAL_ADDRESS, &self.node)),
            self.arm_claim_timeout(),
        ]
    }

    fn handle_frame<R: Rng>(&mut self, id: u32, data: &[u8], _rng: &mut R) -> ProtocolActions {
        if id <= MAX_STANDARD_ID {
            return ProtocolActions::new();
        }
        let j1939_id = J1939Id::decode(id);
        match j1939_id.pgn {
            PGN_ADDRESS_CLAIMED if data.len() >= 8 => {
                let mut name = [0u8; 8];
                name.copy_from_slice(&data[..8]);
                self.arbitrate(j1939_id.source, u64::from_le_bytes(name))
            }
            PGN_REQUEST => self.handle_request(j1939_id, data),
            _ => ProtocolActions::new(),
        }
    }

    fn handle_timer<R: Rng>(&mut self, timer: ProtocolTimer, _rng: &mut R) -> ProtocolActions {
        let ProtocolTimer::ClaimTimeout { generation } = timer else {
            return ProtocolActions::new();
        };
        if generation != self.generation {
            return ProtocolActions::new();
        }
        match self.state {
            AddressClaimState::WaitClaimResponse => {
                self.state = AddressClaimState::WaitClaimTimeout;
                vec![ProtocolAction::Emit(self.own_claim()), self.arm_claim_timeout()]
            }
            AddressClaimState::WaitClaimTimeout => {
                self.state = AddressClaimState::Claimed;
                self.claimed_address = Some(self.preferred_address);
                info!(address = self.preferred_address, "J1939 address claimed");
                ProtocolActions::new()
            }
            _ => ProtocolActions::new(),
        }
    }

    fn fault_follow_up<R: Rng>(&mut self, kind: FaultKind, rng: &mut R) -> FaultFollowUp {
        if kind != FaultKind::AddressClaim {
            return FaultFollowUp::Unsupported;
        }
        let mut peer_name: u64 = rng.gen();
        if peer_name == self.name {
            peer_name ^= 1;
        }
        FaultFollowUp::Frame {
            frame: address_claimed_frame(peer_name, self.contested_address(), PEER_NODE),
            deliver: true,
        }
    }

    fn permits(&self, message_id: u32) -> bool {
        self.state != AddressClaimState::CannotClaim
            || !self.pgn_messages.iter().any(|(_, id)| *id == message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PgnDefinition;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn controller(address: u8, identity: u32) -> J1939Controller {
        J1939Controller::new(&J1939Config {
            preferred_address: address,
            name: J1939Name {
                identity_number: identity,
                ..J1939Name::default()
            },
            ..J1939Config::default()
        })
    }

    fn emitted(actions: &[ProtocolAction]) -> Vec<&OutgoingFrame> {
        actions
            .iter()
            .filter_map(|a| match a {
                ProtocolAction::Emit(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn claim_timer(actions: &[ProtocolAction]) -> ProtocolTimer {
        actions
            .iter()
            .find_map(|a| match a {
                ProtocolAction::Arm { timer, .. } => Some(timer.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_identifier_packing() {
        let claim = J1939Id::new(6, PGN_ADDRESS_CLAIMED, 0x80).encode();
        assert_eq!(claim, 0x18EE_FF80);

        let request = J1939Id::new(6, PGN_REQUEST, NULL_ADDRESS).encode();
        assert_eq!(request, 0x18EA_FFFE);

        let decoded = J1939Id::decode(0x18EA_0B00);
        assert_eq!(decoded.pgn, PGN_REQUEST);
        assert_eq!(decoded.destination, Some(0x0B));
        assert_eq!(decoded.source, 0x00);

        // PDU2: the PS byte is a group extension, not a destination.
        let eec1 = J1939Id::decode(0x0CF0_0400);
        assert_eq!(eec1.pgn, 0xF004);
        assert_eq!(eec1.destination, None);
        assert_eq!(eec1.priority, 3);
        assert_eq!(J1939Id::new(3, 0xF004, 0x00).to(0x22).encode(), 0x0CF0_0400);
    }

    #[test]
    fn test_name_packing() {
        let name = J1939Name {
            identity_number: 0x1F_FFFF,
            manufacturer_code: 0x7FF,
            industry_group: 2,
            arbitrary_address_capable: true,
            ..J1939Name::default()
        };
        let raw = name.to_u64();
        assert_eq!(raw & 0xFFFF_FFFF, 0xFFFF_FFFF);
        assert_eq!(raw >> 63, 1);
        assert_eq!((raw >> 60) & 0x7, 2);
        assert_eq!(J1939Name::from_u64(raw), name);
    }

    #[test]
    fn test_name_validation() {
        let name = J1939Name {
            function_instance: 32,
            ..J1939Name::default()
        };
        assert!(matches!(
            name.validate(),
            Err(ConfigError::NameFieldOutOfRange { field: "function_instance", bits: 5, .. })
        ));
        assert!(J1939Name::default().validate().is_ok());
    }

    #[test]
    fn test_uncontested_claim_sequence() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctl = controller(0x80, 1);

        let actions = ctl.start(&mut rng);
        assert_eq!(emitted(&actions)[0].id, 0x18EA_FFFE);
        assert_eq!(ctl.state(), AddressClaimState::WaitClaimResponse);

        let actions = ctl.handle_timer(claim_timer(&actions), &mut rng);
        assert_eq!(emitted(&actions)[0].id, 0x18EE_FF80);
        assert_eq!(ctl.state(), AddressClaimState::WaitClaimTimeout);

        ctl.handle_timer(claim_timer(&actions), &mut rng);
        assert_eq!(ctl.state(), AddressClaimState::Claimed);
        assert_eq!(ctl.claimed_address(), Some(0x80));
    }

    #[test]
    fn test_smaller_name_wins_arbitration() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctl = controller(0x80, 100);
        ctl.start(&mut rng);

        let higher = address_claimed_frame(200, 0x80, "peer");
        let actions = ctl.handle_frame(higher.id, &higher.data, &mut rng);
        assert_eq!(emitted(&actions).len(), 1);
        assert_eq!(ctl.state(), AddressClaimState::WaitClaimResponse);

        let lower = address_claimed_frame(50, 0x80, "peer");
        let actions = ctl.handle_frame(lower.id, &lower.data, &mut rng);
        assert_eq!(ctl.state(), AddressClaimState::CannotClaim);
        let frames = emitted(&actions);
        assert_eq!(J1939Id::decode(frames[0].id).source, NULL_ADDRESS);
        assert_eq!(ctl.contentions(), 2);
    }

    #[test]
    fn test_stale_claim_timer_is_ignored_after_loss() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctl = controller(0x80, 100);
        let timer = claim_timer(&ctl.start(&mut rng));

        let lower = address_claimed_frame(1, 0x80, "peer");
        ctl.handle_frame(lower.id, &lower.data, &mut rng);
        assert!(ctl.handle_timer(timer, &mut rng).is_empty());
        assert_eq!(ctl.state(), AddressClaimState::CannotClaim);
    }

    #[test]
    fn test_claims_for_other_addresses_and_own_echo_are_ignored() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctl = controller(0x80, 100);
        ctl.start(&mut rng);

        let other = address_claimed_frame(1, 0x81, "peer");
        assert!(ctl.handle_frame(other.id, &other.data, &mut rng).is_empty());
        let echo = address_claimed_frame(ctl.name(), 0x80, "ecu");
        assert!(ctl.handle_frame(echo.id, &echo.data, &mut rng).is_empty());
        assert_eq!(ctl.contentions(), 0);
    }

    #[test]
    fn test_request_for_configured_pgn_transmits_message() {
        let config = J1939Config {
            preferred_address: 0x00,
            pgns: vec![PgnDefinition {
                pgn: 0xFEEE,
                name: "ET1".to_string(),
                priority: 6,
                length: 8,
                cycle_time_ms: 0,
                destination: None,
                spns: Vec::new(),
            }],
            ..J1939Config::default()
        };
        let messages = derived_messages(&config);
        assert_eq!(messages[0].id, 0x18FE_EE00);
        assert!(messages[0].is_extended());

        let mut rng = StdRng::seed_from_u64(1);
        let mut ctl = J1939Controller::new(&config);
        ctl.start(&mut rng);
        let request = request_frame(0xFEEE, 0xF9, GLOBAL_ADDRESS, "tester");
        let actions = ctl.handle_frame(request.id, &request.data, &mut rng);
        assert_eq!(actions, vec![ProtocolAction::Transmit(0x18FE_EE00)]);
    }

    #[test]
    fn test_address_claim_fault_targets_our_address() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut ctl = controller(0x42, 100);
        ctl.start(&mut rng);
        match ctl.fault_follow_up(FaultKind::AddressClaim, &mut rng) {
            FaultFollowUp::Frame { frame, deliver } => {
                assert!(deliver);
                assert_eq!(J1939Id::decode(frame.id).source, 0x42);
                assert_eq!(J1939Id::decode(frame.id).pgn, PGN_ADDRESS_CLAIMED);
            }
            other => panic!("unexpected follow-up {:?}", other),
        }
    }
}
