use crate::config::{ConfigError, ProtocolKind};
use crate::message::FrameError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const DEFAULT_RATE_PER_MINUTE: f64 = 6.0;
const DEFAULT_FOLLOW_UP_DELAY_MS: u64 = 10;

// Relative weights for randomly injected bus errors (sum to 100). Bit and
// stuff errors dominate on real buses.
const BIT_WEIGHT: u32 = 30;
const STUFF_WEIGHT: u32 = 25;
const CRC_WEIGHT: u32 = 20;
const FORM_WEIGHT: u32 = 15;
const ACK_WEIGHT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Bit,
    Stuff,
    Crc,
    Form,
    Ack,
    HeartbeatLost,
    AddressClaim,
    NegativeResponse,
    Timeout,
}

impl FaultKind {
    pub const ALL: [FaultKind; 9] = [
        FaultKind::Bit,
        FaultKind::Stuff,
        FaultKind::Crc,
        FaultKind::Form,
        FaultKind::Ack,
        FaultKind::HeartbeatLost,
        FaultKind::AddressClaim,
        FaultKind::NegativeResponse,
        FaultKind::Timeout,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            FaultKind::Bit => "bit",
            FaultKind::Stuff => "stuff",
            FaultKind::Crc => "crc",
            FaultKind::Form => "form",
            FaultKind::Ack => "ack",
            FaultKind::HeartbeatLost => "heartbeat_lost",
            FaultKind::AddressClaim => "address_claim",
            FaultKind::NegativeResponse => "negative_response",
            FaultKind::Timeout => "timeout",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            FaultKind::Bit => "Bit error: transmitted and monitored bit differ",
            FaultKind::Stuff => "Stuff error: six consecutive equal bits",
            FaultKind::Crc => "CRC error: checksum mismatch",
            FaultKind::Form => "Form error: fixed-form field violated",
            FaultKind::Ack => "ACK error: no receiver acknowledged",
            FaultKind::HeartbeatLost => "CANopen heartbeat consumer timeout",
            FaultKind::AddressClaim => "J1939 address claim conflict",
            FaultKind::NegativeResponse => "UDS negative response",
            FaultKind::Timeout => "UDS response timeout",
        }
    }

    /// Protocol a fault belongs to; `None` for bus-level errors.
    pub fn protocol(self) -> Option<ProtocolKind> {
        match self {
            FaultKind::HeartbeatLost => Some(ProtocolKind::CanOpen),
            FaultKind::AddressClaim => Some(ProtocolKind::J1939),
            FaultKind::NegativeResponse | FaultKind::Timeout => Some(ProtocolKind::Uds),
            _ => None,
        }
    }

    pub fn frame_error(self) -> FrameError {
        FrameError {
            tag: self.tag().to_string(),
            description: self.description().to_string(),
        }
    }
}

impl core::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFault(pub String);

impl FromStr for FaultKind {
    type Err = UnknownFault;

    /// Case-insensitive; `-` and spaces count as `_`, and an `_error`
    /// suffix is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(|c: char| c == '-' || c == ' ', "_");
        let tag = normalized.strip_suffix("_error").unwrap_or(&normalized);
        let kind = match tag {
            "bit" => FaultKind::Bit,
            "stuff" => FaultKind::Stuff,
            "crc" => FaultKind::Crc,
            "form" => FaultKind::Form,
            "ack" => FaultKind::Ack,
            "heartbeat_lost" | "heartbeat" => FaultKind::HeartbeatLost,
            "address_claim" | "address_conflict" => FaultKind::AddressClaim,
            "negative_response" | "nrc" => FaultKind::NegativeResponse,
            "timeout" => FaultKind::Timeout,
            _ => return Err(UnknownFault(s.to_string())),
        };
        Ok(kind)
    }
}

/// Fault injection statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FaultInjectionStats {
    pub total_faults_injected: u32,
    pub bit_faults: u32,
    pub stuff_faults: u32,
    pub crc_faults: u32,
    pub form_faults: u32,
    pub ack_faults: u32,
    pub protocol_faults: u32,
    pub random_faults: u32,
    pub follow_ups_scheduled: u32,
}

/// Configuration for random fault injection. Manual injection is always
/// available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultInjectionConfig {
    pub enabled: bool,
    pub rate_per_minute: f64,
    pub follow_up_delay_ms: u64,
}

impl Default for FaultInjectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_per_minute: DEFAULT_RATE_PER_MINUTE,
            follow_up_delay_ms: DEFAULT_FOLLOW_UP_DELAY_MS,
        }
    }
}

impl FaultInjectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_per_minute.is_finite() || self.rate_per_minute < 0.0 {
            return Err(ConfigError::InvalidFaultRate(self.rate_per_minute));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FaultInjector {
    config: FaultInjectionConfig,
    stats: FaultInjectionStats,
}

impl FaultInjector {
    pub fn new(config: FaultInjectionConfig) -> Self {
        Self {
            config,
            stats: FaultInjectionStats::default(),
        }
    }

    /// Pick the scheduled message an error frame will impersonate.
    pub fn select_target<R: Rng>(&self, scheduled: &[u32], rng: &mut R) -> Option<u32> {
        scheduled.choose(rng).copied()
    }

    /// Delay in simulated ms until the next random fault, or `None` when
    /// random injection is off. Uniform in [0.5, 1.5] of the mean interval.
    pub fn next_random_delay_ms<R: Rng>(&self, rng: &mut R) -> Option<u64> {
        if !self.config.enabled || self.config.rate_per_minute <= 0.0 {
            return None;
        }
        let mean_ms = 60_000.0 / self.config.rate_per_minute;
        Some((mean_ms * rng.gen_range(0.5..=1.5)).round().max(1.0) as u64)
    }

    /// Weighted choice among the bus-level error kinds.
    pub fn random_kind<R: Rng>(&self, rng: &mut R) -> FaultKind {
        let total = BIT_WEIGHT + STUFF_WEIGHT + CRC_WEIGHT + FORM_WEIGHT + ACK_WEIGHT;
        let mut pick = rng.gen_range(0..total);
        for (kind, weight) in [
            (FaultKind::Bit, BIT_WEIGHT),
            (FaultKind::Stuff, STUFF_WEIGHT),
            (FaultKind::Crc, CRC_WEIGHT),
            (FaultKind::Form, FORM_WEIGHT),
        ] {
            if pick < weight {
                return kind;
            }
            pick -= weight;
        }
        FaultKind::Ack
    }

    /// Update statistics when a fault is injected
    pub fn record(&mut self, kind: FaultKind, random: bool) {
        self.stats.total_faults_injected += 1;
        if random {
            self.stats.random_faults += 1;
        }
        match kind {
            FaultKind::Bit => self.stats.bit_faults += 1,
            FaultKind::Stuff => self.stats.stuff_faults += 1,
            FaultKind::Crc => self.stats.crc_faults += 1,
            FaultKind::Form => self.stats.form_faults += 1,
            FaultKind::Ack => self.stats.ack_faults += 1,
            _ => self.stats.protocol_faults += 1,
        }
    }

    pub fn record_follow_up(&mut self) {
        self.stats.follow_ups_scheduled += 1;
    }

    pub fn follow_up_delay_ms(&self) -> u64 {
        self.config.follow_up_delay_ms
    }

    /// Get current fault injection statistics
    pub fn get_stats(&self) -> &FaultInjectionStats {
        &self.stats
    }

    pub fn get_config(&self) -> &FaultInjectionConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
    }
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new(FaultInjectionConfig::default())
    }
}
