//! Characteristic-oriented binary transport, laid out like the scale
//! firmware's GATT service.

use crate::commands::{CommandDispatcher, ScaleCommand};
use crate::protocol::encode_packet;
use crate::state::StateManager;
use crate::types::{ScaleError, ScaleState};
use log::{debug, warn};
use std::io::{self, Read};
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4a4e0001_6746_4b4e_8164_656e67696e65);
pub const WEIGHT_CHAR_UUID: Uuid = Uuid::from_u128(0x4a4e0002_6746_4b4e_8164_656e67696e65);
pub const TARE_CHAR_UUID: Uuid = Uuid::from_u128(0x4a4e0003_6746_4b4e_8164_656e67696e65);
pub const CALIBRATE_CHAR_UUID: Uuid = Uuid::from_u128(0x4a4e0004_6746_4b4e_8164_656e67696e65);
pub const BATTERY_CHAR_UUID: Uuid = Uuid::from_u128(0x4a4e0005_6746_4b4e_8164_656e67696e65);

/// Command byte clients put in front of the calibration weight. The value
/// itself is not checked.
pub const CALIBRATE_OPCODE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Characteristic {
    Weight,
    Tare,
    Calibrate,
    Battery,
}

impl Characteristic {
    pub fn from_uuid(id: &Uuid) -> Option<Self> {
        [
            Characteristic::Weight,
            Characteristic::Tare,
            Characteristic::Calibrate,
            Characteristic::Battery,
        ]
        .into_iter()
        .find(|characteristic| characteristic.uuid() == *id)
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Characteristic::Weight => WEIGHT_CHAR_UUID,
            Characteristic::Tare => TARE_CHAR_UUID,
            Characteristic::Calibrate => CALIBRATE_CHAR_UUID,
            Characteristic::Battery => BATTERY_CHAR_UUID,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Characteristic::Tare | Characteristic::Calibrate)
    }
}

/// Decodes a characteristic write into a command.
///
/// Tare accepts any payload. Calibrate expects a command byte followed by
/// the known weight as a little-endian f32.
pub fn parse_write(characteristic: Characteristic, payload: &[u8]) -> Result<ScaleCommand, ScaleError> {
    match characteristic {
        Characteristic::Tare => Ok(ScaleCommand::Tare),
        Characteristic::Calibrate => {
            if payload.len() < 5 {
                return Err(ScaleError::InvalidPayload(format!(
                    "calibrate write needs 5 bytes, got {}",
                    payload.len()
                )));
            }
            let weight = f32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            if !weight.is_finite() || weight <= 0.0 {
                return Err(ScaleError::InvalidPayload(format!(
                    "calibration weight must be positive, got {}",
                    weight
                )));
            }
            Ok(ScaleCommand::Calibrate { weight })
        }
        Characteristic::Weight | Characteristic::Battery => Err(ScaleError::UnknownCommand(format!(
            "{:?} characteristic is read-only",
            characteristic
        ))),
    }
}

pub fn read_value(characteristic: Characteristic, state: &ScaleState) -> Vec<u8> {
    match characteristic {
        Characteristic::Weight => encode_packet(state).to_vec(),
        Characteristic::Battery => vec![state.battery_level()],
        Characteristic::Calibrate => state.calibration_factor().to_le_bytes().to_vec(),
        Characteristic::Tare => Vec::new(),
    }
}

/// Characteristic write as framed on a byte stream: 16-byte characteristic
/// id, one length byte, then the payload.
pub const WRITE_HEADER_LEN: usize = 17;

pub fn encode_write_request(id: &Uuid, payload: &[u8]) -> Option<Vec<u8>> {
    let len = u8::try_from(payload.len()).ok()?;
    let mut frame = Vec::with_capacity(WRITE_HEADER_LEN + payload.len());
    frame.extend_from_slice(id.as_bytes());
    frame.push(len);
    frame.extend_from_slice(payload);
    Some(frame)
}

/// Reads one framed write. A clean end of stream before the next frame
/// yields `Ok(None)`.
pub fn read_write_request<R: Read>(reader: &mut R) -> io::Result<Option<(Uuid, Vec<u8>)>> {
    let mut header = [0u8; WRITE_HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&header[..16]);
    let mut payload = vec![0u8; usize::from(header[16])];
    reader.read_exact(&mut payload)?;
    Ok(Some((Uuid::from_bytes(id), payload)))
}

/// Routes reads and writes on the scale service to the shared state.
#[derive(Clone)]
pub struct GattService {
    dispatcher: CommandDispatcher,
    state: StateManager,
}

impl GattService {
    pub fn new(dispatcher: CommandDispatcher) -> Self {
        let state = dispatcher.state().clone();
        Self { dispatcher, state }
    }

    pub async fn write(&self, id: &Uuid, payload: &[u8]) -> Result<ScaleState, ScaleError> {
        let characteristic = Characteristic::from_uuid(id).ok_or_else(|| {
            warn!("Write to unknown characteristic {}", id);
            ScaleError::UnknownCharacteristic(*id)
        })?;
        debug!("GATT write {:?}: {:02X?}", characteristic, payload);

        let command = parse_write(characteristic, payload)?;
        self.dispatcher.dispatch(command).await
    }

    pub async fn read(&self, id: &Uuid) -> Result<Vec<u8>, ScaleError> {
        let characteristic =
            Characteristic::from_uuid(id).ok_or(ScaleError::UnknownCharacteristic(*id))?;
        let state = self.state.snapshot().await;
        Ok(read_value(characteristic, &state))
    }
}
