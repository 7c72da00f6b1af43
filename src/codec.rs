//! Bit-level signal packing.
//!
//! A signal is mapped onto the payload as a short list of [`BitSpan`]s, each
//! covering consecutive bits of a single byte. Decode and encode walk the same
//! list, so they are inverses by construction. Raw values are accumulated in a
//! `u64`; floating point only appears in the physical scaling step.

use crate::message::{ByteOrder, SignalDefinition};
use arrayvec::ArrayVec;

/// A 64-bit field starting mid-byte touches at most nine bytes.
const MAX_SPANS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit of the run within the byte (0..=7).
    pub bit_offset: u8,
    /// Number of bits in the run (1..=8).
    pub num_bits: u8,
    /// Position of the run's lowest bit inside the raw value.
    pub value_shift: u8,
}

impl BitSpan {
    fn mask(self) -> u8 {
        ((1u16 << self.num_bits) - 1) as u8
    }
}

pub type BitSpans = ArrayVec<BitSpan, MAX_SPANS>;

/// Byte/bit runs occupied by `signal`. Empty when the bit length is 0 or
/// larger than 64.
pub fn bit_spans(signal: &SignalDefinition) -> BitSpans {
    let mut spans = BitSpans::new();
    if signal.bit_length == 0 || signal.bit_length > 64 {
        return spans;
    }

    let mut byte_index = usize::from(signal.start_bit / 8);
    let mut bit_index = (signal.start_bit % 8) as u8;
    let mut remaining = signal.bit_length;

    match signal.byte_order {
        ByteOrder::LittleEndian => {
            let mut value_shift = 0u8;
            while remaining > 0 {
                let num_bits = (8 - bit_index).min(remaining);
                spans.push(BitSpan {
                    byte_index,
                    bit_offset: bit_index,
                    num_bits,
                    value_shift,
                });
                value_shift += num_bits;
                remaining -= num_bits;
                byte_index += 1;
                bit_index = 0;
            }
        }
        ByteOrder::BigEndian => {
            // Start bit is the MSB; walk down the byte, then continue at bit 7
            // of the next byte.
            while remaining > 0 {
                let num_bits = (bit_index + 1).min(remaining);
                remaining -= num_bits;
                spans.push(BitSpan {
                    byte_index,
                    bit_offset: bit_index + 1 - num_bits,
                    num_bits,
                    value_shift: remaining,
                });
                byte_index += 1;
                bit_index = 7;
            }
        }
    }

    spans
}

/// True when every byte the signal touches lies inside a payload of `len`
/// bytes.
pub fn fits(signal: &SignalDefinition, len: usize) -> bool {
    let spans = bit_spans(signal);
    !spans.is_empty() && spans.iter().all(|span| span.byte_index < len)
}

fn value_mask(bit_length: u8) -> u64 {
    if bit_length >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_length) - 1
    }
}

/// Extract the raw value of `signal`. Returns 0 when the signal does not fit
/// the payload.
pub fn decode(payload: &[u8], signal: &SignalDefinition) -> i64 {
    if !fits(signal, payload.len()) {
        return 0;
    }

    let mut value: u64 = 0;
    for span in bit_spans(signal) {
        let bits = (payload[span.byte_index] >> span.bit_offset) & span.mask();
        value |= u64::from(bits) << span.value_shift;
    }

    let len = signal.bit_length;
    if signal.signed && len < 64 && (value >> (len - 1)) & 1 == 1 {
        (value | !value_mask(len)) as i64
    } else {
        value as i64
    }
}

/// Write `raw` into the bits owned by `signal`, leaving every other bit of
/// the payload untouched. No-op when the signal does not fit.
pub fn encode(payload: &mut [u8], signal: &SignalDefinition, raw: i64) {
    if !fits(signal, payload.len()) {
        return;
    }

    let bits = (raw as u64) & value_mask(signal.bit_length);
    for span in bit_spans(signal) {
        let mask = span.mask();
        let chunk = ((bits >> span.value_shift) as u8) & mask;
        payload[span.byte_index] &= !(mask << span.bit_offset);
        payload[span.byte_index] |= chunk << span.bit_offset;
    }
}

/// `raw * scale + offset`. Unsigned raw values are read back through `u64`
/// so 64-bit fields with the top bit set stay positive.
pub fn to_physical(raw: i64, signal: &SignalDefinition) -> f64 {
    let value = if signal.signed {
        raw as f64
    } else {
        raw as u64 as f64
    };
    value * signal.effective_scale() + signal.offset
}

/// `round((physical - offset) / scale)`, saturated to the raw range of the
/// field.
pub fn to_raw(physical: f64, signal: &SignalDefinition) -> i64 {
    let scaled = ((physical - signal.offset) / signal.effective_scale()).round();
    let (min, max) = signal.raw_bounds();
    // `as` saturates and maps NaN to zero.
    let raw = (scaled as i128).clamp(min, max);
    if signal.signed {
        raw as i64
    } else {
        raw as u64 as i64
    }
}
