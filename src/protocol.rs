use crate::types::{ScaleError, ScaleState, WeightUnit};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

pub const PACKET_MAGIC: [u8; 4] = *b"SCLE";
pub const PACKET_LEN: usize = 12;

/// Decoded view of a weight packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePacket {
    pub display_weight: f32,
    pub unit: WeightUnit,
    pub stable: bool,
    pub battery: u8,
    pub error_code: u8,
}

/// Structured representation for text transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub weight: f32,
    pub raw_weight: f32,
    pub unit: String,
    pub stable: bool,
    pub battery: u8,
    pub error: u8,
}

#[derive(Debug, Serialize)]
struct ErrorMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    error: &'static str,
    message: &'a str,
}

fn round_one_decimal(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

pub fn encode_packet(state: &ScaleState) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0..4].copy_from_slice(&PACKET_MAGIC);
    packet[4..8].copy_from_slice(&state.display_weight().to_le_bytes());
    packet[8] = state.unit().code();
    packet[9] = u8::from(state.is_stable());
    packet[10] = state.battery_level();
    packet[11] = state.error_code();
    packet
}

pub fn decode_packet(data: &[u8]) -> Result<ScalePacket, ScaleError> {
    debug!("Decoding weight packet: {:02X?}", data);

    if data.len() != PACKET_LEN {
        warn!("Invalid packet length: expected {}, got {}", PACKET_LEN, data.len());
        return Err(ScaleError::MalformedPacket(format!(
            "expected {} bytes, got {}",
            PACKET_LEN,
            data.len()
        )));
    }

    if data[0..4] != PACKET_MAGIC {
        warn!("Invalid packet magic: {:02X?}", &data[0..4]);
        return Err(ScaleError::MalformedPacket(format!(
            "bad magic {:02X?}",
            &data[0..4]
        )));
    }

    let unit = WeightUnit::from_code(data[8])
        .ok_or_else(|| ScaleError::MalformedPacket(format!("unknown unit code {}", data[8])))?;

    Ok(ScalePacket {
        display_weight: f32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        unit,
        stable: data[9] != 0,
        battery: data[10],
        error_code: data[11],
    })
}

pub fn to_message(state: &ScaleState) -> ScaleMessage {
    ScaleMessage {
        message_type: "weight".to_string(),
        weight: round_one_decimal(state.display_weight()),
        raw_weight: round_one_decimal(state.raw_weight()),
        unit: state.unit().symbol().to_string(),
        stable: state.is_stable(),
        battery: state.battery_level(),
        error: state.error_code(),
    }
}

pub fn encode_message(state: &ScaleState) -> String {
    // ScaleMessage has no map keys or non-string keys, serialization cannot fail
    serde_json::to_string(&to_message(state)).unwrap_or_default()
}

pub fn encode_error(error: &ScaleError) -> String {
    let message = error.to_string();
    serde_json::to_string(&ErrorMessage {
        message_type: "error",
        error: error.reason(),
        message: &message,
    })
    .unwrap_or_default()
}

/// One broadcast tick's worth of output: both encodings built from the same
/// snapshot, so binary and text observers always agree.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub packet: [u8; PACKET_LEN],
    pub message: String,
}

impl Frame {
    pub fn from_state(state: &ScaleState) -> Self {
        Self {
            packet: encode_packet(state),
            message: encode_message(state),
        }
    }
}
