//! The simulation session.
//!
//! [`SimulationEngine`] owns the node registry, message table, signal table,
//! scheduler, active protocol module, statistics collector and fault
//! injector. It is single-threaded: every timer callback runs to completion
//! inside [`SimulationEngine::tick`] (or [`SimulationEngine::run_simulated`])
//! and frames are published in emission order.

use crate::codec;
use crate::config::{ConfigError, ProtocolConfig, ProtocolKind, SimConfig};
use crate::fault_injection::{FaultInjectionStats, FaultInjector, FaultKind};
use crate::history::FrameHistory;
use crate::message::{
    is_valid_payload_length, DecodedSignal, FrameEvent, MessageDefinition, SignalDefinition, SignalKey,
    SignalValue, ValueSource, MAX_CLASSIC_PAYLOAD_LEN, MAX_EXTENDED_ID, MAX_PAYLOAD_LEN, MAX_STANDARD_ID,
};
use crate::nodes::{Node, NodeRegistry};
use crate::protocols::canopen::{self, NmtCommand, NmtState};
use crate::protocols::j1939::{self, AddressClaimState, GLOBAL_ADDRESS};
use crate::protocols::{FaultFollowUp, OutgoingFrame, ProtocolAction, ProtocolActions, ProtocolStack, ProtocolTimer};
use crate::scheduler::{FrameScheduler, ScheduleState, SchedulerStats, MAX_SPEED};
use crate::statistics::{StatisticsCollector, StatisticsSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Random-walk step as a fraction of the signal's physical span.
const RANDOM_WALK_STEP: f64 = 0.05;
const ERROR_FRAME_NAME: &str = "ErrorFrame";
const RAW_FRAME_NAME: &str = "Raw";
const BUS_SOURCE: &str = "bus";
const EXTERNAL_SOURCE: &str = "external";
const UNASSIGNED_SOURCE: &str = "unassigned";
/// Source address used for J1939 requests injected from outside.
const J1939_TOOL_ADDRESS: u8 = 0xF9;
const J1939_TOOL_NODE: &str = "tester";

pub type FrameCallback = Box<dyn FnMut(&FrameEvent) + Send>;
pub type StatisticsCallback = Box<dyn FnMut(&StatisticsSnapshot) + Send>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Simulation is not running")]
    NotRunning,
    #[error("Simulation is already running")]
    AlreadyRunning,
    #[error("Speed multiplier {0} must be greater than zero and at most 1000000")]
    InvalidSpeed(f64),
    #[error("No message registered with id {0:#x}")]
    UnknownMessage(u32),
    #[error("Unknown fault type '{0}'")]
    UnknownFault(String),
    #[error("Payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLong { len: usize, max: usize },
    #[error("No CAN-FD DLC encodes a {0}-byte payload")]
    InvalidPayloadLength(usize),
    #[error("Identifier {0:#x} exceeds 29 bits")]
    InvalidIdentifier(u32),
    #[error("{request} requests need a {expected} session, this one is {actual}")]
    ProtocolMismatch {
        request: &'static str,
        expected: ProtocolKind,
        actual: ProtocolKind,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// An externally requested transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SendRequest {
    /// Put `data` on the bus verbatim.
    Raw {
        id: u32,
        data: Vec<u8>,
        #[serde(default)]
        extended: bool,
    },
    /// Set signals of a registered message (held as manual values) and
    /// transmit it once.
    Signals { id: u32, values: BTreeMap<String, f64> },
    /// NMT module control; `node_id` 0 addresses all nodes.
    Nmt {
        command: NmtCommand,
        #[serde(default)]
        node_id: u8,
    },
    /// Diagnostic request from the tester.
    Uds {
        service: u8,
        #[serde(default)]
        data: Vec<u8>,
    },
    /// J1939 Request PGN.
    J1939Request {
        pgn: u32,
        #[serde(default = "default_destination")]
        destination: u8,
    },
}

fn default_destination() -> u8 {
    GLOBAL_ADDRESS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub running: bool,
    pub speed: f64,
    pub frames_emitted: u64,
    pub runs: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
enum EngineTimer {
    Message(u32),
    Statistics,
    RandomFault,
    Protocol(ProtocolTimer),
    FaultFollowUp { frame: OutgoingFrame, deliver: bool },
}

fn validate_speed(speed: f64) -> Result<(), EngineError> {
    if speed > 0.0 && speed <= MAX_SPEED {
        Ok(())
    } else {
        Err(EngineError::InvalidSpeed(speed))
    }
}

fn initial_value<R: Rng>(signal: &SignalDefinition, rng: &mut R) -> f64 {
    let (lo, hi) = signal.physical_bounds();
    if lo.is_finite() && hi.is_finite() && hi > lo {
        rng.gen_range(lo..=hi)
    } else {
        lo
    }
}

fn random_walk<R: Rng>(current: f64, signal: &SignalDefinition, rng: &mut R) -> f64 {
    let (lo, hi) = signal.physical_bounds();
    let step = (hi - lo) * RANDOM_WALK_STEP;
    if !(step.is_finite() && step > 0.0) {
        return lo;
    }
    (current + rng.gen_range(-step..=step)).clamp(lo, hi)
}

pub struct SimulationEngine {
    config: SimConfig,
    registry: NodeRegistry,
    messages: BTreeMap<u32, MessageDefinition>,
    signal_values: HashMap<SignalKey, SignalValue>,
    /// Unquantized random-walk positions, so small steps are not lost to
    /// raw rounding.
    walk_positions: HashMap<SignalKey, f64>,
    scheduler: FrameScheduler<EngineTimer>,
    protocol: ProtocolStack,
    statistics: StatisticsCollector,
    fault_injector: FaultInjector,
    history: FrameHistory,
    rng: StdRng,
    state: EngineState,
    outbox: Vec<FrameEvent>,
    frame_subscribers: Vec<FrameCallback>,
    statistics_subscribers: Vec<StatisticsCallback>,
}

impl core::fmt::Debug for SimulationEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulationEngine")
            .field("protocol", &self.protocol.kind())
            .field("nodes", &self.registry.len())
            .field("messages", &self.messages.len())
            .field("state", &self.state)
            .finish()
    }
}

impl SimulationEngine {
    /// Build a session. The configuration is validated up front; malformed
    /// nodes and messages are skipped with a warning.
    pub fn new(mut config: SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let nodes = std::mem::take(&mut config.nodes);
        let messages = std::mem::take(&mut config.messages);

        let mut engine = Self {
            registry: NodeRegistry::new(),
            messages: BTreeMap::new(),
            signal_values: HashMap::new(),
            walk_positions: HashMap::new(),
            scheduler: FrameScheduler::new(config.jitter_percent / 100.0),
            protocol: ProtocolStack::from_config(&config.protocol),
            statistics: StatisticsCollector::new(config.nominal_bit_rate()),
            fault_injector: FaultInjector::new(config.fault_injection.clone()),
            history: FrameHistory::new(),
            rng,
            state: EngineState {
                running: false,
                speed: 1.0,
                frames_emitted: 0,
                runs: 0,
                last_error: None,
            },
            outbox: Vec::new(),
            frame_subscribers: Vec::new(),
            statistics_subscribers: Vec::new(),
            config,
        };

        engine.init_nodes(nodes);
        let mut definitions = messages;
        if let ProtocolConfig::J1939(j1939_config) = &engine.config.protocol {
            definitions.extend(j1939::derived_messages(j1939_config));
        }
        for definition in definitions {
            // Rejections are logged and recorded in `last_error`.
            let _ = engine.register_message(definition);
        }

        info!(
            protocol = %engine.protocol.kind(),
            nodes = engine.registry.len(),
            messages = engine.messages.len(),
            "Simulation session created"
        );
        Ok(engine)
    }

    /// Replace the node set. Ignored while running; returns the number of
    /// nodes accepted.
    pub fn init_nodes(&mut self, nodes: Vec<Node>) -> usize {
        if self.state.running {
            warn!("Node registry is fixed while the simulation runs");
            return self.registry.len();
        }
        self.registry.init(nodes)
    }

    fn reject(&mut self, error: ConfigError) -> Result<(), ConfigError> {
        warn!("{}", error);
        self.state.last_error = Some(error.to_string());
        Err(error)
    }

    /// Add a message to the table. Signals that do not fit the payload are
    /// dropped individually; the message itself is rejected for an invalid
    /// identifier, length or a duplicate id.
    pub fn register_message(&mut self, mut definition: MessageDefinition) -> Result<(), ConfigError> {
        let id = definition.id;
        if id > MAX_EXTENDED_ID {
            return self.reject(ConfigError::InvalidMessage {
                id,
                reason: "identifier exceeds 29 bits".to_string(),
            });
        }
        if !is_valid_payload_length(definition.length, self.config.can_fd) {
            let reason = format!(
                "payload length {} not allowed on {} CAN",
                definition.length,
                if self.config.can_fd { "FD" } else { "classic" }
            );
            return self.reject(ConfigError::InvalidMessage { id, reason });
        }
        if self.messages.contains_key(&id) {
            return self.reject(ConfigError::DuplicateMessage(id));
        }
        if id > MAX_STANDARD_ID {
            definition.extended = true;
        }

        let length = definition.length;
        let mut seen: Vec<String> = Vec::with_capacity(definition.signals.len());
        definition.signals.retain(|signal| {
            if signal.name.is_empty() || seen.contains(&signal.name) {
                warn!(message = id, signal = %signal.name, "Dropping unnamed or duplicate signal");
                return false;
            }
            if !codec::fits(signal, length) {
                warn!(
                    message = id,
                    signal = %signal.name,
                    start_bit = signal.start_bit,
                    bit_length = signal.bit_length,
                    "Dropping signal outside the payload"
                );
                return false;
            }
            seen.push(signal.name.clone());
            true
        });

        if let Some(node) = &definition.node {
            if !self.registry.contains(node) {
                warn!(message = id, node = %node, "Message assigned to unknown node");
            }
        }

        debug!(id, name = %definition.name, cycle_ms = definition.cycle_time_ms, "Registered message");
        let cycle = definition.cycle_time_ms;
        self.messages.insert(id, definition);
        self.scheduler.register(id);
        if self.state.running && cycle > 0 {
            self.scheduler
                .schedule_message(id, cycle, &mut self.rng, EngineTimer::Message(id));
        }
        Ok(())
    }

    pub fn on_frame<F>(&mut self, callback: F)
    where
        F: FnMut(&FrameEvent) + Send + 'static,
    {
        self.frame_subscribers.push(Box::new(callback));
    }

    pub fn on_statistics<F>(&mut self, callback: F)
    where
        F: FnMut(&StatisticsSnapshot) + Send + 'static,
    {
        self.statistics_subscribers.push(Box::new(callback));
    }

    pub fn start(&mut self, speed: f64) -> Result<(), EngineError> {
        if self.state.running {
            return Err(EngineError::AlreadyRunning);
        }
        validate_speed(speed)?;

        self.scheduler.reset(speed);
        self.statistics.reset();
        self.history.clear();
        self.state.running = true;
        self.state.speed = speed;
        self.state.runs += 1;
        info!(protocol = %self.protocol.kind(), speed, "Simulation starting");

        let periodic: Vec<(u32, u64)> = self
            .messages
            .values()
            .filter(|m| m.is_periodic())
            .map(|m| (m.id, m.cycle_time_ms))
            .collect();
        for (id, cycle) in periodic {
            self.scheduler
                .schedule_message(id, cycle, &mut self.rng, EngineTimer::Message(id));
        }
        self.scheduler
            .arm(self.config.statistics_interval_ms as f64, EngineTimer::Statistics);
        if let Some(delay) = self.fault_injector.next_random_delay_ms(&mut self.rng) {
            self.scheduler.arm(delay as f64, EngineTimer::RandomFault);
        }

        let actions = self.protocol.start(&mut self.rng);
        self.apply_actions(actions);
        Ok(())
    }

    /// Cancel every pending timer. Idempotent.
    pub fn stop(&mut self) {
        if !self.state.running {
            return;
        }
        self.state.running = false;
        let cancelled = self.scheduler.cancel_all();
        info!(cancelled, at_ms = self.scheduler.now_ms(), "Simulation stopped");
    }

    /// Change the speed factor. Timers already armed keep their host
    /// deadline.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), EngineError> {
        validate_speed(speed)?;
        self.scheduler.set_speed(speed);
        self.state.speed = speed;
        debug!(speed, "Speed changed");
        Ok(())
    }

    /// Advance the host clock by `delta_ms` and fire everything that falls
    /// due.
    pub fn tick(&mut self, delta_ms: u64) {
        self.advance_host_us(delta_ms as f64 * 1000.0);
    }

    /// Advance until `sim_ms` of simulated time have passed at the current
    /// speed.
    pub fn run_simulated(&mut self, sim_ms: u64) {
        let host_us = sim_ms as f64 * 1000.0 / self.scheduler.speed();
        self.advance_host_us(host_us);
    }

    fn advance_host_us(&mut self, delta_us: f64) {
        if !self.state.running {
            return;
        }
        let target = self.scheduler.host_time_us() + delta_us;
        while self.state.running {
            match self.scheduler.pop_due(target) {
                Some(timer) => self.fire(timer),
                None => break,
            }
        }
        if self.state.running {
            self.scheduler.advance_to(target);
        }
    }

    fn fire(&mut self, timer: EngineTimer) {
        match timer {
            EngineTimer::Message(id) => {
                if self.protocol.permits(id) {
                    if let Some(event) = self.compose(id) {
                        self.emit(event);
                    }
                } else {
                    trace!(id, "Transmission held back by protocol state");
                }
                if let Some(cycle) = self.messages.get(&id).map(|m| m.cycle_time_ms) {
                    self.scheduler
                        .schedule_message(id, cycle, &mut self.rng, EngineTimer::Message(id));
                }
            }
            EngineTimer::Statistics => {
                let snapshot = self.statistics.snapshot(self.scheduler.now_ms());
                for callback in self.statistics_subscribers.iter_mut() {
                    callback(&snapshot);
                }
                self.scheduler
                    .arm(self.config.statistics_interval_ms as f64, EngineTimer::Statistics);
            }
            EngineTimer::RandomFault => {
                let kind = self.fault_injector.random_kind(&mut self.rng);
                self.inject(kind, true);
                if let Some(delay) = self.fault_injector.next_random_delay_ms(&mut self.rng) {
                    self.scheduler.arm(delay as f64, EngineTimer::RandomFault);
                }
            }
            EngineTimer::Protocol(timer) => {
                let actions = self.protocol.handle_timer(timer, &mut self.rng);
                self.apply_actions(actions);
            }
            EngineTimer::FaultFollowUp { frame, deliver } => {
                if deliver {
                    self.emit_and_deliver(frame);
                } else {
                    self.emit_outgoing(frame);
                }
            }
        }
    }

    fn apply_actions(&mut self, actions: ProtocolActions) {
        for action in actions {
            match action {
                ProtocolAction::Emit(frame) => self.emit_outgoing(frame),
                ProtocolAction::Arm { delay_ms, timer } => {
                    self.scheduler.arm(delay_ms as f64, EngineTimer::Protocol(timer));
                }
                ProtocolAction::Transmit(id) => {
                    if let Some(event) = self.compose(id) {
                        self.emit(event);
                    }
                }
            }
        }
    }

    /// Build the next payload of a registered message from the signal table,
    /// advancing the random walk of simulated signals.
    fn compose(&mut self, id: u32) -> Option<FrameEvent> {
        let now = self.scheduler.now_ms();
        let message = self.messages.get(&id)?;
        let mut data = vec![0u8; message.length];
        let mut decoded = Vec::with_capacity(message.signals.len());

        for signal in &message.signals {
            let key = SignalKey::new(id, &signal.name);
            let (target, source) = match self.signal_values.get(&key) {
                Some(value) if value.source == ValueSource::Manual => (value.physical, ValueSource::Manual),
                Some(value) => {
                    let position = self.walk_positions.get(&key).copied().unwrap_or(value.physical);
                    (random_walk(position, signal, &mut self.rng), ValueSource::Simulated)
                }
                None => (initial_value(signal, &mut self.rng), ValueSource::Simulated),
            };
            if source == ValueSource::Simulated {
                self.walk_positions.insert(key.clone(), target);
            }

            let raw = codec::to_raw(target, signal);
            codec::encode(&mut data, signal, raw);
            let physical = codec::to_physical(raw, signal);
            self.signal_values.insert(
                key,
                SignalValue {
                    raw,
                    physical,
                    source,
                    updated_at_ms: now,
                },
            );
            decoded.push(DecodedSignal {
                name: signal.name.clone(),
                raw,
                physical,
                unit: signal.unit.clone(),
            });
        }

        Some(FrameEvent {
            timestamp_ms: now,
            id,
            extended: message.is_extended(),
            name: message.name.clone(),
            length: message.length,
            data,
            source: message.node.clone().unwrap_or_else(|| UNASSIGNED_SOURCE.to_string()),
            signals: decoded,
            error: None,
        })
    }

    fn decode_signals(&self, id: u32, data: &[u8]) -> Vec<DecodedSignal> {
        let Some(message) = self.messages.get(&id) else {
            return Vec::new();
        };
        message
            .signals
            .iter()
            .filter(|signal| codec::fits(signal, data.len()))
            .map(|signal| {
                let raw = codec::decode(data, signal);
                DecodedSignal {
                    name: signal.name.clone(),
                    raw,
                    physical: codec::to_physical(raw, signal),
                    unit: signal.unit.clone(),
                }
            })
            .collect()
    }

    /// Store the signals of an externally sent frame as simulated values.
    fn absorb_signals(&mut self, id: u32, signals: &[DecodedSignal]) {
        let now = self.scheduler.now_ms();
        for signal in signals {
            let key = SignalKey::new(id, &signal.name);
            self.walk_positions.remove(&key);
            self.signal_values.insert(
                key,
                SignalValue {
                    raw: signal.raw,
                    physical: signal.physical,
                    source: ValueSource::Simulated,
                    updated_at_ms: now,
                },
            );
        }
    }

    fn emit(&mut self, event: FrameEvent) {
        self.statistics.record(&event);
        self.state.frames_emitted += 1;
        trace!(id = event.id, name = %event.name, at_ms = event.timestamp_ms, "Frame");
        for callback in self.frame_subscribers.iter_mut() {
            callback(&event);
        }
        self.history.push(event.clone());
        self.outbox.push(event);
    }

    fn emit_outgoing(&mut self, frame: OutgoingFrame) {
        let signals = self.decode_signals(frame.id, &frame.data);
        let event = FrameEvent {
            timestamp_ms: self.scheduler.now_ms(),
            id: frame.id,
            extended: frame.extended || frame.id > MAX_STANDARD_ID,
            name: frame.name.to_string(),
            length: frame.data.len(),
            data: frame.data.to_vec(),
            source: frame.source,
            signals,
            error: None,
        };
        self.emit(event);
    }

    /// Emit a frame and hand it to the protocol module as if received.
    fn emit_and_deliver(&mut self, frame: OutgoingFrame) {
        let id = frame.id;
        let data = frame.data.clone();
        self.emit_outgoing(frame);
        self.deliver(id, &data);
    }

    fn deliver(&mut self, id: u32, data: &[u8]) {
        let actions = self.protocol.handle_frame(id, data, &mut self.rng);
        self.apply_actions(actions);
    }

    fn require_protocol(&self, request: &'static str, expected: ProtocolKind) -> Result<(), EngineError> {
        let actual = self.protocol.kind();
        if actual == expected {
            Ok(())
        } else {
            Err(EngineError::ProtocolMismatch {
                request,
                expected,
                actual,
            })
        }
    }

    /// Transmit a frame on behalf of an external client. The frame is
    /// published and then dispatched to the active protocol module.
    pub fn send_message(&mut self, request: SendRequest) -> Result<(), EngineError> {
        if !self.state.running {
            return Err(EngineError::NotRunning);
        }

        match request {
            SendRequest::Raw { id, data, extended } => {
                if id > MAX_EXTENDED_ID {
                    return Err(EngineError::InvalidIdentifier(id));
                }
                let max = if self.config.can_fd {
                    MAX_PAYLOAD_LEN
                } else {
                    MAX_CLASSIC_PAYLOAD_LEN
                };
                if data.len() > max {
                    return Err(EngineError::PayloadTooLong { len: data.len(), max });
                }
                if !is_valid_payload_length(data.len(), self.config.can_fd) {
                    return Err(EngineError::InvalidPayloadLength(data.len()));
                }

                let signals = self.decode_signals(id, &data);
                self.absorb_signals(id, &signals);
                let (name, source) = match self.messages.get(&id) {
                    Some(m) => (
                        m.name.clone(),
                        m.node.clone().unwrap_or_else(|| EXTERNAL_SOURCE.to_string()),
                    ),
                    None => (RAW_FRAME_NAME.to_string(), EXTERNAL_SOURCE.to_string()),
                };
                let event = FrameEvent {
                    timestamp_ms: self.scheduler.now_ms(),
                    id,
                    extended: extended || id > MAX_STANDARD_ID,
                    name,
                    length: data.len(),
                    data: data.clone(),
                    source,
                    signals,
                    error: None,
                };
                self.emit(event);
                self.deliver(id, &data);
            }
            SendRequest::Signals { id, values } => {
                let message = self.messages.get(&id).ok_or(EngineError::UnknownMessage(id))?;
                let now = self.scheduler.now_ms();
                for (name, value) in &values {
                    let Some(signal) = message.signal(name) else {
                        warn!(message = id, signal = %name, "Ignoring unknown signal");
                        continue;
                    };
                    let raw = codec::to_raw(*value, signal);
                    let key = SignalKey::new(id, name);
                    self.walk_positions.remove(&key);
                    self.signal_values.insert(
                        key,
                        SignalValue {
                            raw,
                            physical: codec::to_physical(raw, signal),
                            source: ValueSource::Manual,
                            updated_at_ms: now,
                        },
                    );
                }
                if let Some(event) = self.compose(id) {
                    let data = event.data.clone();
                    self.emit(event);
                    self.deliver(id, &data);
                }
            }
            SendRequest::Nmt { command, node_id } => {
                self.require_protocol("NMT", ProtocolKind::CanOpen)?;
                self.emit_and_deliver(canopen::nmt_frame(command, node_id));
            }
            SendRequest::Uds { service, data } => {
                let frame = match self.protocol.uds() {
                    Some(uds) => uds.request_frame(service, &data),
                    None => {
                        return Err(EngineError::ProtocolMismatch {
                            request: "UDS",
                            expected: ProtocolKind::Uds,
                            actual: self.protocol.kind(),
                        })
                    }
                };
                self.emit_and_deliver(frame);
            }
            SendRequest::J1939Request { pgn, destination } => {
                self.require_protocol("J1939 request", ProtocolKind::J1939)?;
                self.emit_and_deliver(j1939::request_frame(
                    pgn,
                    J1939_TOOL_ADDRESS,
                    destination,
                    J1939_TOOL_NODE,
                ));
            }
        }
        Ok(())
    }

    /// Inject a fault by tag (see [`FaultKind`] for the accepted names).
    pub fn inject_error(&mut self, tag: &str) -> Result<(), EngineError> {
        if !self.state.running {
            return Err(EngineError::NotRunning);
        }
        let kind: FaultKind = tag
            .parse()
            .map_err(|_| EngineError::UnknownFault(tag.to_string()))?;
        self.inject(kind, false);
        Ok(())
    }

    fn inject(&mut self, kind: FaultKind, random: bool) {
        let scheduled = self.scheduler.scheduled_ids();
        let target = self.fault_injector.select_target(&scheduled, &mut self.rng);
        let now = self.scheduler.now_ms();

        let event = match target.and_then(|id| self.messages.get(&id)) {
            Some(message) => FrameEvent {
                timestamp_ms: now,
                id: message.id,
                extended: message.is_extended(),
                name: message.name.clone(),
                length: message.length,
                data: vec![0xFF; message.length],
                source: message.node.clone().unwrap_or_else(|| UNASSIGNED_SOURCE.to_string()),
                signals: Vec::new(),
                error: Some(kind.frame_error()),
            },
            None => FrameEvent {
                timestamp_ms: now,
                id: 0,
                extended: false,
                name: ERROR_FRAME_NAME.to_string(),
                length: 0,
                data: Vec::new(),
                source: BUS_SOURCE.to_string(),
                signals: Vec::new(),
                error: Some(kind.frame_error()),
            },
        };
        info!(fault = %kind, id = event.id, random, "Injecting fault");
        self.emit(event);
        self.fault_injector.record(kind, random);

        if kind.protocol().is_none() {
            return;
        }
        match self.protocol.fault_follow_up(kind, &mut self.rng) {
            FaultFollowUp::Frame { frame, deliver } => {
                let delay = self.fault_injector.follow_up_delay_ms();
                self.scheduler
                    .arm(delay as f64, EngineTimer::FaultFollowUp { frame, deliver });
                self.fault_injector.record_follow_up();
            }
            FaultFollowUp::Silence => debug!(fault = %kind, "Fault modelled as silence"),
            FaultFollowUp::Unsupported => warn!(
                fault = %kind,
                protocol = %self.protocol.kind(),
                "Fault does not apply to this protocol; only the error frame was emitted"
            ),
        }
    }

    /// Take every frame emitted since the last call.
    pub fn drain_events(&mut self) -> Vec<FrameEvent> {
        core::mem::take(&mut self.outbox)
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    pub fn get_state(&self) -> &EngineState {
        &self.state
    }

    pub fn protocol_kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    pub fn protocol(&self) -> &ProtocolStack {
        &self.protocol
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Simulated milliseconds since the current run started.
    pub fn now_ms(&self) -> f64 {
        self.scheduler.now_ms()
    }

    pub fn nodes(&self) -> &[Node] {
        self.registry.list()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.registry.get(id)
    }

    pub fn message(&self, id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&id)
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.values()
    }

    pub fn signal_value(&self, message_id: u32, signal: &str) -> Option<f64> {
        self.signal_state(message_id, signal).map(|v| v.physical)
    }

    pub fn signal_state(&self, message_id: u32, signal: &str) -> Option<&SignalValue> {
        self.signal_values.get(&SignalKey::new(message_id, signal))
    }

    /// Statistics as of now (not necessarily the last published snapshot).
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.compute(self.scheduler.now_ms())
    }

    pub fn frame_count(&self, id: u32) -> u64 {
        self.statistics.frame_count(id)
    }

    pub fn history(&self) -> &FrameHistory {
        &self.history
    }

    pub fn schedule_state(&self, message_id: u32) -> Option<ScheduleState> {
        self.scheduler.schedule_state(message_id)
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn get_scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.get_stats()
    }

    pub fn get_fault_injection_stats(&self) -> &FaultInjectionStats {
        self.fault_injector.get_stats()
    }

    pub fn set_fault_injection_enabled(&mut self, enabled: bool) {
        self.fault_injector.set_enabled(enabled);
    }

    pub fn j1939_state(&self) -> Option<AddressClaimState> {
        self.protocol.j1939().map(|c| c.state())
    }

    pub fn nmt_state(&self) -> Option<NmtState> {
        self.protocol.canopen().map(|n| n.state())
    }
}
