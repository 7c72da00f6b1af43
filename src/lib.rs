//! # CAN Bus Simulator
//!
//! A virtual-time CAN bus simulation library: configured ECUs transmit
//! periodic frames with realistically evolving signal values while optional
//! higher-layer protocol behaviour (J1939 address claiming, CANopen NMT and
//! heartbeat, UDS diagnostics) reacts to bus traffic.
//!
//! ## Features
//!
//! - **Signal codec**: Intel and Motorola bit layouts, signed fields, scaling
//! - **Virtual time**: speed factor, cycle jitter, deterministic seeded runs
//! - **Protocols**: J1939 NAME arbitration, CANopen NMT slave, UDS server
//! - **Statistics**: bus load, throughput and frame counters
//! - **Fault injection**: bus-level error frames and protocol-specific faults
//!
//! ## Quick Start
//!
//! ```rust
//! use cansim::{MessageDefinition, SignalDefinition, SimConfig, SimulationEngine};
//!
//! let config = SimConfig::default().with_seed(1).with_message(
//!     MessageDefinition::new(0x100, "EngineData", 8)
//!         .with_cycle_time(100)
//!         .with_signal(SignalDefinition::new("RPM", 0, 16).with_scaling(0.25, 0.0)),
//! );
//! let mut engine = SimulationEngine::new(config).unwrap();
//! engine.start(1.0).unwrap();
//! engine.run_simulated(1_000);
//!
//! for frame in engine.drain_events() {
//!     println!("{:>8.1} ms  {:#05x}  {:02X?}", frame.timestamp_ms, frame.id, frame.data);
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`engine`] - Session orchestrator and public API
//! - [`codec`] - Bit-level signal packing
//! - [`scheduler`] - Virtual-time timer queue
//! - [`protocols`] - J1939, CANopen and UDS behaviour models
//! - [`statistics`] - Bus load accounting
//! - [`fault_injection`] - Error frames and protocol faults
//! - [`control`] - JSON command surface used by the binaries

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod codec;
pub mod config;
pub mod control;
pub mod engine;
pub mod fault_injection;
pub mod history;
pub mod message;
pub mod nodes;
pub mod protocols;
pub mod scheduler;
pub mod statistics;

// Re-export main public types for convenience
pub use config::{ConfigError, ProtocolConfig, ProtocolKind, SimConfig};
pub use engine::{EngineError, SendRequest, SimulationEngine};
pub use message::{FrameEvent, MessageDefinition, SignalDefinition};
pub use nodes::{Node, NodeRole};
pub use statistics::StatisticsSnapshot;
