//! UDS (ISO 14229) server answering single-frame requests.
//!
//! Requests may arrive with or without an ISO-TP single-frame PCI byte; the
//! response mirrors whichever framing the request used.

use super::{FaultFollowUp, OutgoingFrame, ProtocolAction, ProtocolActions, ProtocolBehavior, ProtocolTimer};
use crate::config::UdsConfig;
use crate::fault_injection::FaultKind;
use crate::message::MAX_CLASSIC_PAYLOAD_LEN;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::debug;

pub const SID_DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
pub const SID_ECU_RESET: u8 = 0x11;
pub const SID_READ_DATA_BY_IDENTIFIER: u8 = 0x22;
pub const SID_SECURITY_ACCESS: u8 = 0x27;
pub const SID_TESTER_PRESENT: u8 = 0x3E;
pub const NEGATIVE_RESPONSE: u8 = 0x7F;
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

pub const NRC_INCORRECT_LENGTH: u8 = 0x13;
pub const NRC_CONDITIONS_NOT_CORRECT: u8 = 0x22;

/// Single-frame PCI lengths are 1..=7 on classic CAN.
const MAX_SINGLE_FRAME_LEN: usize = MAX_CLASSIC_PAYLOAD_LEN - 1;
/// P2 server max 50 ms, P2* server max 5000 ms (10 ms resolution).
const SESSION_TIMING: [u8; 4] = [0x00, 0x32, 0x01, 0xF4];

/// A request with its framing already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsRequest {
    pub framed: bool,
    pub service: u8,
    pub params: Vec<u8>,
}

impl UdsRequest {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let first = *data.first()?;
        let pci_len = usize::from(first);
        if first < 0x08 && pci_len >= 1 && pci_len <= data.len() - 1 {
            let body = &data[1..=pci_len];
            return Some(Self {
                framed: true,
                service: body[0],
                params: body[1..].to_vec(),
            });
        }
        Some(Self {
            framed: false,
            service: first,
            params: data[1..].to_vec(),
        })
    }

    fn sub_function(&self) -> u8 {
        self.params.first().copied().unwrap_or(0)
    }
}

fn frame_payload(framed: bool, payload: &[u8]) -> Vec<u8> {
    if framed {
        let len = payload.len().min(MAX_SINGLE_FRAME_LEN);
        let mut data = Vec::with_capacity(len + 1);
        data.push(len as u8);
        data.extend_from_slice(&payload[..len]);
        data
    } else {
        payload.to_vec()
    }
}

#[derive(Debug)]
pub struct UdsResponder {
    request_id: u32,
    response_id: u32,
    response_delay_ms: u64,
    ecu_node: String,
    tester_node: String,
    did_values: BTreeMap<u16, Vec<u8>>,
    generation: u32,
    /// Responses armed in the current generation and not yet sent.
    in_flight: u32,
    suppress_next: bool,
    last_service: Option<u8>,
    last_framed: bool,
    responses_sent: u32,
    responses_dropped: u32,
}

impl UdsResponder {
    pub fn new(config: &UdsConfig) -> Self {
        Self {
            request_id: config.request_id,
            response_id: config.response_id,
            response_delay_ms: config.response_delay_ms,
            ecu_node: config.ecu_node.clone(),
            tester_node: config.tester_node.clone(),
            did_values: config.did_values.clone(),
            generation: 0,
            in_flight: 0,
            suppress_next: false,
            last_service: None,
            last_framed: true,
            responses_sent: 0,
            responses_dropped: 0,
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn response_id(&self) -> u32 {
        self.response_id
    }

    pub fn responses_sent(&self) -> u32 {
        self.responses_sent
    }

    pub fn responses_dropped(&self) -> u32 {
        self.responses_dropped
    }

    /// Tester-side request frame, framed with a PCI byte when it fits a
    /// single frame.
    pub fn request_frame(&self, service: u8, params: &[u8]) -> OutgoingFrame {
        let mut body = Vec::with_capacity(params.len() + 1);
        body.push(service);
        body.extend_from_slice(params);
        let framed = body.len() <= MAX_SINGLE_FRAME_LEN;
        OutgoingFrame::new(self.request_id, "UDS_Request", &self.tester_node, &frame_payload(framed, &body))
    }

    fn response_frame(&self, framed: bool, payload: &[u8]) -> OutgoingFrame {
        let name = if payload.first() == Some(&NEGATIVE_RESPONSE) {
            "UDS_NegativeResponse"
        } else {
            "UDS_Response"
        };
        OutgoingFrame::new(self.response_id, name, &self.ecu_node, &frame_payload(framed, payload))
    }

    fn positive_response<R: Rng>(&self, request: &UdsRequest, rng: &mut R) -> Vec<u8> {
        let sid = request.service;
        let response_sid = sid.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        let sub = request.sub_function();
        match sid {
            SID_DIAGNOSTIC_SESSION_CONTROL => {
                let mut payload = vec![response_sid, sub];
                payload.extend_from_slice(&SESSION_TIMING);
                payload
            }
            SID_ECU_RESET | SID_TESTER_PRESENT => vec![response_sid, sub],
            SID_READ_DATA_BY_IDENTIFIER => {
                if request.params.len() < 2 {
                    return vec![NEGATIVE_RESPONSE, sid, NRC_INCORRECT_LENGTH];
                }
                let did = u16::from_be_bytes([request.params[0], request.params[1]]);
                let mut payload = vec![response_sid, request.params[0], request.params[1]];
                match self.did_values.get(&did) {
                    Some(value) => payload.extend_from_slice(value),
                    None => payload.extend_from_slice(&rng.gen::<[u8; 4]>()),
                }
                payload
            }
            SID_SECURITY_ACCESS => {
                let level = if request.params.is_empty() { 1 } else { sub };
                let mut payload = vec![response_sid, level];
                // Odd levels request a seed, even levels send the key.
                if level % 2 == 1 {
                    payload.extend_from_slice(&rng.gen::<[u8; 4]>());
                }
                payload
            }
            _ => {
                let mut payload = vec![response_sid];
                payload.extend_from_slice(&request.params);
                payload
            }
        }
    }

    fn drop_in_flight(&mut self) {
        if self.in_flight > 0 {
            debug!(dropped = self.in_flight, "Dropping pending UDS responses");
            self.responses_dropped += self.in_flight;
            self.in_flight = 0;
            self.generation = self.generation.wrapping_add(1);
        } else {
            debug!("Suppressing next UDS response");
            self.suppress_next = true;
        }
    }
}

impl ProtocolBehavior for UdsResponder {
    fn start<R: Rng>(&mut self, _rng: &mut R) -> ProtocolActions {
        self.generation = self.generation.wrapping_add(1);
        self.in_flight = 0;
        self.suppress_next = false;
        self.last_service = None;
        ProtocolActions::new()
    }

    fn handle_frame<R: Rng>(&mut self, id: u32, data: &[u8], rng: &mut R) -> ProtocolActions {
        if id != self.request_id {
            return ProtocolActions::new();
        }
        let Some(request) = UdsRequest::parse(data) else {
            return ProtocolActions::new();
        };
        self.last_service = Some(request.service);
        self.last_framed = request.framed;

        if self.suppress_next {
            self.suppress_next = false;
            self.responses_dropped += 1;
            debug!(service = request.service, "UDS response suppressed");
            return ProtocolActions::new();
        }

        let payload = self.positive_response(&request, rng);
        let frame = self.response_frame(request.framed, &payload);
        self.in_flight += 1;
        vec![ProtocolAction::Arm {
            delay_ms: self.response_delay_ms,
            timer: ProtocolTimer::UdsResponse {
                generation: self.generation,
                frame,
            },
        }]
    }

    fn handle_timer<R: Rng>(&mut self, timer: ProtocolTimer, _rng: &mut R) -> ProtocolActions {
        let ProtocolTimer::UdsResponse { generation, frame } = timer else {
            return ProtocolActions::new();
        };
        if generation != self.generation {
            return ProtocolActions::new();
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        self.responses_sent += 1;
        vec![ProtocolAction::Emit(frame)]
    }

    fn fault_follow_up<R: Rng>(&mut self, kind: FaultKind, _rng: &mut R) -> FaultFollowUp {
        match kind {
            FaultKind::NegativeResponse => {
                let sid = self.last_service.unwrap_or(SID_READ_DATA_BY_IDENTIFIER);
                let payload = [NEGATIVE_RESPONSE, sid, NRC_CONDITIONS_NOT_CORRECT];
                FaultFollowUp::Frame {
                    frame: self.response_frame(self.last_framed, &payload),
                    deliver: false,
                }
            }
            FaultKind::Timeout => {
                self.drop_in_flight();
                FaultFollowUp::Silence
            }
            _ => FaultFollowUp::Unsupported,
        }
    }
}
