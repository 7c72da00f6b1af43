use serde::{Deserialize, Serialize};

/// Largest payload a CAN-FD frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 64;
/// Largest payload a classic CAN frame can carry.
pub const MAX_CLASSIC_PAYLOAD_LEN: usize = 8;
/// Highest 11-bit identifier; anything above needs the extended format.
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Highest 29-bit identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Payload lengths a CAN-FD DLC can express.
const FD_PAYLOAD_LENGTHS: [usize; 15] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel layout: the start bit names the least significant bit.
    #[default]
    LittleEndian,
    /// Motorola layout: the start bit names the most significant bit.
    BigEndian,
}

/// Layout and scaling of one signal inside a message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub name: String,
    pub start_bit: u16,
    #[serde(alias = "length")]
    pub bit_length: u8,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale", alias = "factor")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub unit: String,
}

fn default_scale() -> f64 {
    1.0
}

impl SignalDefinition {
    pub fn new(name: &str, start_bit: u16, bit_length: u8) -> Self {
        Self {
            name: name.to_string(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            min: None,
            max: None,
            unit: String::new(),
        }
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = unit.to_string();
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Scale factor with zero and non-finite values replaced by 1.
    pub fn effective_scale(&self) -> f64 {
        if self.scale.is_finite() && self.scale != 0.0 {
            self.scale
        } else {
            1.0
        }
    }

    /// Smallest and largest raw value the bit field can hold.
    pub fn raw_bounds(&self) -> (i128, i128) {
        let bits = u32::from(self.bit_length.clamp(1, 64));
        if self.signed {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        } else {
            (0, (1i128 << bits) - 1)
        }
    }

    /// Physical range used by the random walk: the configured min/max when
    /// present, otherwise the physical image of the raw range. An image that
    /// overflows `f64` collapses to the offset.
    pub fn physical_bounds(&self) -> (f64, f64) {
        let (raw_min, raw_max) = self.raw_bounds();
        let scale = self.effective_scale();
        let a = raw_min as f64 * scale + self.offset;
        let b = raw_max as f64 * scale + self.offset;
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let fallback = if self.offset.is_finite() { self.offset } else { 0.0 };
        let lo = self
            .min
            .filter(|v| v.is_finite())
            .unwrap_or(if lo.is_finite() { lo } else { fallback });
        let hi = self
            .max
            .filter(|v| v.is_finite())
            .unwrap_or(if hi.is_finite() { hi } else { fallback });
        if lo <= hi {
            (lo, hi)
        } else {
            (hi, lo)
        }
    }
}

/// A configured frame: identifier, payload length, cadence and signal layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDefinition {
    pub id: u32,
    pub name: String,
    #[serde(alias = "dlc")]
    pub length: usize,
    #[serde(default)]
    pub cycle_time_ms: u64,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub extended: bool,
    #[serde(default)]
    pub signals: Vec<SignalDefinition>,
}

impl MessageDefinition {
    pub fn new(id: u32, name: &str, length: usize) -> Self {
        Self {
            id,
            name: name.to_string(),
            length,
            cycle_time_ms: 0,
            node: None,
            extended: id > MAX_STANDARD_ID,
            signals: Vec::new(),
        }
    }

    pub fn with_cycle_time(mut self, cycle_time_ms: u64) -> Self {
        self.cycle_time_ms = cycle_time_ms;
        self
    }

    pub fn with_node(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn is_extended(&self) -> bool {
        self.extended || self.id > MAX_STANDARD_ID
    }

    pub fn is_periodic(&self) -> bool {
        self.cycle_time_ms > 0
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// Whether `length` is a payload size the bus can carry.
pub fn is_valid_payload_length(length: usize, can_fd: bool) -> bool {
    if can_fd {
        length == MAX_PAYLOAD_LEN || FD_PAYLOAD_LENGTHS.contains(&length)
    } else {
        length <= MAX_CLASSIC_PAYLOAD_LEN
    }
}

/// Typed key of the runtime signal table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalKey {
    pub message_id: u32,
    pub signal: String,
}

impl SignalKey {
    pub fn new(message_id: u32, signal: &str) -> Self {
        Self {
            message_id,
            signal: signal.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// Produced by the random walk or decoded from a received frame.
    Simulated,
    /// Set explicitly through a send request; held until overwritten.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalValue {
    pub raw: i64,
    pub physical: f64,
    pub source: ValueSource,
    pub updated_at_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    pub name: String,
    pub raw: i64,
    pub physical: f64,
    pub unit: String,
}

/// Error tag carried by a synthetic error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameError {
    pub tag: String,
    pub description: String,
}

/// One transmission observed on the simulated bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub timestamp_ms: f64,
    pub id: u32,
    pub extended: bool,
    pub name: String,
    pub length: usize,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub source: String,
    pub signals: Vec<DecodedSignal>,
    pub error: Option<FrameError>,
}

impl FrameEvent {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }
}
