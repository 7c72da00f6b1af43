//! Bus load and throughput accounting.

use crate::message::FrameEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// Per-frame bit estimate: identifier, data, CRC/ACK/EOF overhead and
// intermission. Stuff bits and the FD data phase are not modelled.
const ID_BITS: u64 = 11;
const OVERHEAD_BITS: u64 = 15;
const INTERMISSION_BITS: u64 = 3;

pub fn frame_bits(payload_len: usize) -> u64 {
    ID_BITS + 8 * payload_len as u64 + OVERHEAD_BITS + INTERMISSION_BITS
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub timestamp_ms: f64,
    #[serde(rename = "busLoadPercent")]
    pub bus_load: f64,
    pub message_count: u64,
    pub error_count: u64,
    pub throughput_kbps: f64,
    pub frames_per_second: f64,
}

#[derive(Debug, Clone)]
pub struct StatisticsCollector {
    bit_rate: u32,
    message_count: u64,
    error_count: u64,
    cumulative_bits: u64,
    per_identifier: BTreeMap<u32, u64>,
    last_snapshot: StatisticsSnapshot,
}

impl StatisticsCollector {
    pub fn new(bit_rate: u32) -> Self {
        Self {
            bit_rate,
            message_count: 0,
            error_count: 0,
            cumulative_bits: 0,
            per_identifier: BTreeMap::new(),
            last_snapshot: StatisticsSnapshot::default(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.bit_rate);
    }

    pub fn record(&mut self, frame: &FrameEvent) {
        self.message_count += 1;
        if frame.is_error() {
            self.error_count += 1;
        }
        self.cumulative_bits += frame_bits(frame.data.len());
        *self.per_identifier.entry(frame.id).or_insert(0) += 1;
    }

    /// Rates over `elapsed_ms` of simulated time; all zero before any time
    /// has passed.
    pub fn compute(&self, elapsed_ms: f64) -> StatisticsSnapshot {
        let elapsed_s = elapsed_ms / 1000.0;
        let (bus_load, throughput_kbps, frames_per_second) = if elapsed_s > 0.0 {
            let bits = self.cumulative_bits as f64;
            let load = bits / (f64::from(self.bit_rate) * elapsed_s) * 100.0;
            (
                load.clamp(0.0, 100.0),
                bits / elapsed_s / 1000.0,
                self.message_count as f64 / elapsed_s,
            )
        } else {
            (0.0, 0.0, 0.0)
        };
        StatisticsSnapshot {
            timestamp_ms: elapsed_ms,
            bus_load,
            message_count: self.message_count,
            error_count: self.error_count,
            throughput_kbps,
            frames_per_second,
        }
    }

    /// Compute and remember a snapshot.
    pub fn snapshot(&mut self, elapsed_ms: f64) -> StatisticsSnapshot {
        self.last_snapshot = self.compute(elapsed_ms);
        self.last_snapshot
    }

    pub fn last_snapshot(&self) -> StatisticsSnapshot {
        self.last_snapshot
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn cumulative_bits(&self) -> u64 {
        self.cumulative_bits
    }

    pub fn frame_count(&self, id: u32) -> u64 {
        self.per_identifier.get(&id).copied().unwrap_or(0)
    }

    pub fn per_identifier(&self) -> &BTreeMap<u32, u64> {
        &self.per_identifier
    }
}
