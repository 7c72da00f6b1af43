//! Session configuration.
//!
//! Everything the engine needs at construction time lives in [`SimConfig`]:
//! the protocol block (one variant per supported protocol), bus flags, RNG
//! seed, timing knobs, nodes and messages. The protocol block is validated once
//! by [`SimConfig::validate`]; message and signal definitions are checked when
//! they are registered and skipped individually when malformed.

use crate::fault_injection::FaultInjectionConfig;
use crate::message::{MessageDefinition, SignalDefinition, MAX_EXTENDED_ID};
use crate::nodes::Node;
use crate::protocols::j1939::J1939Name;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub const CLASSIC_BIT_RATE: u32 = 500_000;
pub const FD_BIT_RATE: u32 = 1_000_000;

const DEFAULT_JITTER_PERCENT: f64 = 10.0;
const MAX_JITTER_PERCENT: f64 = 50.0;
const DEFAULT_STATISTICS_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("J1939 preferred address {0} is reserved (254 null, 255 global)")]
    InvalidAddress(u8),
    #[error("J1939 NAME field '{field}' value {value} does not fit in {bits} bits")]
    NameFieldOutOfRange {
        field: &'static str,
        value: u64,
        bits: u32,
    },
    #[error("CANopen node id {0} outside 1..=127")]
    InvalidNodeId(u8),
    #[error("UDS request and response identifiers are both {0:#x}")]
    ConflictingUdsIds(u32),
    #[error("Identifier {0:#x} exceeds 29 bits")]
    IdentifierOutOfRange(u32),
    #[error("Jitter of {0}% outside 0..=50")]
    InvalidJitter(f64),
    #[error("Statistics interval must be greater than zero")]
    InvalidStatisticsInterval,
    #[error("Random fault rate {0} per minute is not a finite, non-negative number")]
    InvalidFaultRate(f64),
    #[error("Message {id:#x} rejected: {reason}")]
    InvalidMessage { id: u32, reason: String },
    #[error("Message {0:#x} is already registered")]
    DuplicateMessage(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolKind {
    Can,
    J1939,
    CanOpen,
    Uds,
}

impl core::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProtocolKind::Can => write!(f, "CAN"),
            ProtocolKind::J1939 => write!(f, "J1939"),
            ProtocolKind::CanOpen => write!(f, "CANopen"),
            ProtocolKind::Uds => write!(f, "UDS"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolConfig {
    #[default]
    Can,
    J1939(J1939Config),
    #[serde(rename = "canopen")]
    CanOpen(CanOpenConfig),
    Uds(UdsConfig),
}

impl ProtocolConfig {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProtocolConfig::Can => ProtocolKind::Can,
            ProtocolConfig::J1939(_) => ProtocolKind::J1939,
            ProtocolConfig::CanOpen(_) => ProtocolKind::CanOpen,
            ProtocolConfig::Uds(_) => ProtocolKind::Uds,
        }
    }
}

/// One parameter group of the J1939 PGN table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PgnDefinition {
    pub pgn: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_j1939_priority")]
    pub priority: u8,
    #[serde(default = "default_pgn_length")]
    pub length: usize,
    #[serde(default)]
    pub cycle_time_ms: u64,
    /// Destination for PDU1 groups; ignored for PDU2.
    #[serde(default)]
    pub destination: Option<u8>,
    #[serde(default)]
    pub spns: Vec<SpnDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpnDefinition {
    #[serde(default)]
    pub spn: u32,
    #[serde(flatten)]
    pub signal: SignalDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct J1939Config {
    #[serde(default = "default_preferred_address")]
    pub preferred_address: u8,
    #[serde(default)]
    pub name: J1939Name,
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    /// Registry node that transmits on behalf of the controller.
    #[serde(default = "default_ecu_node")]
    pub node: String,
    #[serde(default)]
    pub pgns: Vec<PgnDefinition>,
}

impl Default for J1939Config {
    fn default() -> Self {
        Self {
            preferred_address: default_preferred_address(),
            name: J1939Name::default(),
            claim_timeout_ms: default_claim_timeout_ms(),
            node: default_ecu_node(),
            pgns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanOpenConfig {
    #[serde(default = "default_canopen_node_id")]
    pub node_id: u8,
    #[serde(default = "default_heartbeat_time_ms")]
    pub heartbeat_time_ms: u64,
    /// Enter OPERATIONAL right after boot-up instead of waiting for an NMT
    /// Start command.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    #[serde(default = "default_ecu_node")]
    pub node: String,
}

impl Default for CanOpenConfig {
    fn default() -> Self {
        Self {
            node_id: default_canopen_node_id(),
            heartbeat_time_ms: default_heartbeat_time_ms(),
            auto_start: true,
            node: default_ecu_node(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdsConfig {
    #[serde(default = "default_uds_request_id")]
    pub request_id: u32,
    #[serde(default = "default_uds_response_id")]
    pub response_id: u32,
    #[serde(default = "default_uds_response_delay_ms")]
    pub response_delay_ms: u64,
    #[serde(default = "default_ecu_node")]
    pub ecu_node: String,
    #[serde(default = "default_tester_node")]
    pub tester_node: String,
    /// Values returned by ReadDataByIdentifier; other DIDs get placeholder
    /// bytes.
    #[serde(default)]
    pub did_values: BTreeMap<u16, Vec<u8>>,
}

impl Default for UdsConfig {
    fn default() -> Self {
        Self {
            request_id: default_uds_request_id(),
            response_id: default_uds_response_id(),
            response_delay_ms: default_uds_response_delay_ms(),
            ecu_node: default_ecu_node(),
            tester_node: default_tester_node(),
            did_values: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_j1939_priority() -> u8 {
    6
}
fn default_pgn_length() -> usize {
    8
}
fn default_preferred_address() -> u8 {
    0x80
}
fn default_claim_timeout_ms() -> u64 {
    250
}
fn default_ecu_node() -> String {
    "ecu".to_string()
}
fn default_tester_node() -> String {
    "tester".to_string()
}
fn default_canopen_node_id() -> u8 {
    1
}
fn default_heartbeat_time_ms() -> u64 {
    1000
}
fn default_uds_request_id() -> u32 {
    0x7E0
}
fn default_uds_response_id() -> u32 {
    0x7E8
}
fn default_uds_response_delay_ms() -> u64 {
    50
}
fn default_jitter_percent() -> f64 {
    DEFAULT_JITTER_PERCENT
}
fn default_statistics_interval_ms() -> u64 {
    DEFAULT_STATISTICS_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub can_fd: bool,
    /// Seed for jitter, placeholder payloads and fault selection. `None` seeds
    /// from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
    #[serde(default = "default_statistics_interval_ms")]
    pub statistics_interval_ms: u64,
    #[serde(default)]
    pub fault_injection: FaultInjectionConfig,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub messages: Vec<MessageDefinition>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::new(ProtocolConfig::Can)
    }
}

impl SimConfig {
    pub fn new(protocol: ProtocolConfig) -> Self {
        Self {
            protocol,
            can_fd: false,
            seed: None,
            jitter_percent: DEFAULT_JITTER_PERCENT,
            statistics_interval_ms: DEFAULT_STATISTICS_INTERVAL_MS,
            fault_injection: FaultInjectionConfig::default(),
            nodes: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_can_fd(mut self, can_fd: bool) -> Self {
        self.can_fd = can_fd;
        self
    }

    pub fn with_jitter_percent(mut self, jitter_percent: f64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_message(mut self, message: MessageDefinition) -> Self {
        self.messages.push(message);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    /// Nominal bit rate used for bus-load accounting.
    pub fn nominal_bit_rate(&self) -> u32 {
        if self.can_fd {
            FD_BIT_RATE
        } else {
            CLASSIC_BIT_RATE
        }
    }

    /// Check the protocol block and timing knobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=MAX_JITTER_PERCENT).contains(&self.jitter_percent) {
            return Err(ConfigError::InvalidJitter(self.jitter_percent));
        }
        if self.statistics_interval_ms == 0 {
            return Err(ConfigError::InvalidStatisticsInterval);
        }
        self.fault_injection.validate()?;

        match &self.protocol {
            ProtocolConfig::Can => Ok(()),
            ProtocolConfig::J1939(j1939) => {
                if j1939.preferred_address >= crate::protocols::j1939::NULL_ADDRESS {
                    return Err(ConfigError::InvalidAddress(j1939.preferred_address));
                }
                j1939.name.validate()
            }
            ProtocolConfig::CanOpen(canopen) => {
                if canopen.node_id == 0 || canopen.node_id > 127 {
                    return Err(ConfigError::InvalidNodeId(canopen.node_id));
                }
                Ok(())
            }
            ProtocolConfig::Uds(uds) => {
                for id in [uds.request_id, uds.response_id] {
                    if id > MAX_EXTENDED_ID {
                        return Err(ConfigError::IdentifierOutOfRange(id));
                    }
                }
                if uds.request_id == uds.response_id {
                    return Err(ConfigError::ConflictingUdsIds(uds.request_id));
                }
                Ok(())
            }
        }
    }
}
