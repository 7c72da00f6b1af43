//! JSON control surface: one command per line in, one response per line out.

use crate::engine::{EngineError, SendRequest, SimulationEngine};
use crate::message::FrameEvent;
use crate::statistics::StatisticsSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const MAX_COMMAND_SIZE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    Ping,
    Start {
        #[serde(default = "default_speed")]
        speed: f64,
    },
    Stop,
    SetSpeed { speed: f64 },
    Send(SendRequest),
    InjectFault { fault: String },
    SetFaultInjection { enabled: bool },
    GetStatistics,
    GetNodes,
    GetMessages,
    GetSignal { message_id: u32, signal: String },
    GetProtocolState,
}

fn default_speed() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    InvalidCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp_ms: f64,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Lines written to a control client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Frame(&'a FrameEvent),
    Statistics(&'a StatisticsSnapshot),
    Response(&'a CommandResponse),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid JSON command: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Command of {0} bytes exceeds the 4096-byte limit")]
    MessageTooLarge(usize),
}

#[derive(Debug, Default)]
pub struct ControlHandler {
    commands_handled: u32,
    commands_failed: u32,
}

impl ControlHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_command(&self, json_str: &str) -> Result<Command, ControlError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ControlError::MessageTooLarge(json_str.len()));
        }
        Ok(serde_json::from_str(json_str.trim())?)
    }

    /// Parse and run one command line. Unparseable input yields an
    /// `InvalidCommand` response with id 0.
    pub fn handle_line(&mut self, engine: &mut SimulationEngine, line: &str) -> CommandResponse {
        match self.parse_command(line) {
            Ok(command) => self.execute(engine, command),
            Err(e) => {
                self.commands_failed += 1;
                self.create_response(engine, 0, ResponseStatus::InvalidCommand, Some(e.to_string()), None)
            }
        }
    }

    pub fn execute(&mut self, engine: &mut SimulationEngine, command: Command) -> CommandResponse {
        self.commands_handled += 1;
        let id = command.id;
        match self.run(engine, command.command_type) {
            Ok(data) => self.create_response(engine, id, ResponseStatus::Success, None, data),
            Err(e) => {
                self.commands_failed += 1;
                self.create_response(engine, id, ResponseStatus::Error, Some(e.to_string()), None)
            }
        }
    }

    fn run(&mut self, engine: &mut SimulationEngine, command: CommandType) -> Result<Option<Value>, EngineError> {
        let data = match command {
            CommandType::Ping => Some(json!("pong")),
            CommandType::Start { speed } => {
                engine.start(speed)?;
                None
            }
            CommandType::Stop => {
                engine.stop();
                None
            }
            CommandType::SetSpeed { speed } => {
                engine.set_speed(speed)?;
                None
            }
            CommandType::Send(request) => {
                engine.send_message(request)?;
                None
            }
            CommandType::InjectFault { fault } => {
                engine.inject_error(&fault)?;
                None
            }
            CommandType::SetFaultInjection { enabled } => {
                engine.set_fault_injection_enabled(enabled);
                None
            }
            CommandType::GetStatistics => Some(json!({
                "statistics": engine.statistics(),
                "faults": engine.get_fault_injection_stats(),
                "scheduler": engine.get_scheduler_stats(),
            })),
            CommandType::GetNodes => Some(json!(engine.nodes())),
            CommandType::GetMessages => {
                let messages: Vec<_> = engine.messages().collect();
                Some(json!(messages))
            }
            CommandType::GetSignal { message_id, signal } => {
                engine.message(message_id).ok_or(EngineError::UnknownMessage(message_id))?;
                Some(json!(engine.signal_state(message_id, &signal)))
            }
            CommandType::GetProtocolState => Some(json!({
                "protocol": engine.protocol_kind(),
                "running": engine.is_running(),
                "time_ms": engine.now_ms(),
                "j1939": engine.j1939_state(),
                "nmt": engine.nmt_state(),
            })),
        };
        Ok(data)
    }

    fn create_response(
        &self,
        engine: &SimulationEngine,
        id: u32,
        status: ResponseStatus,
        message: Option<String>,
        data: Option<Value>,
    ) -> CommandResponse {
        CommandResponse {
            id,
            timestamp_ms: engine.now_ms(),
            status,
            message,
            data,
        }
    }

    pub fn commands_handled(&self) -> u32 {
        self.commands_handled
    }

    pub fn commands_failed(&self) -> u32 {
        self.commands_failed
    }
}
