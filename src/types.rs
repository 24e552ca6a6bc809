use serde::{Deserialize, Serialize};

pub const CALIBRATION_MIN_RAW_WEIGHT_G: f32 = 10.0;
pub const DEFAULT_BATTERY_PERCENT: u8 = 85;
pub const MAX_BATTERY_PERCENT: u8 = 100;

// Last packet byte; 0 is healthy, the firmware reports overload as 2
pub const ERROR_NONE: u8 = 0;
pub const ERROR_OVERLOAD: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Grams,
    Kilograms,
    Pounds,
    Ounces,
}

impl WeightUnit {
    pub fn code(&self) -> u8 {
        match self {
            WeightUnit::Grams => 0,
            WeightUnit::Kilograms => 1,
            WeightUnit::Pounds => 2,
            WeightUnit::Ounces => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WeightUnit::Grams),
            1 => Some(WeightUnit::Kilograms),
            2 => Some(WeightUnit::Pounds),
            3 => Some(WeightUnit::Ounces),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            WeightUnit::Grams => "g",
            WeightUnit::Kilograms => "kg",
            WeightUnit::Pounds => "lb",
            WeightUnit::Ounces => "oz",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleError {
    CalibrationRejected { raw_weight: f32 },
    MalformedPacket(String),
    UnknownCommand(String),
    InvalidPayload(String),
    UnknownCharacteristic(uuid::Uuid),
}

impl ScaleError {
    /// Stable tag used in structured error replies.
    pub fn reason(&self) -> &'static str {
        match self {
            ScaleError::CalibrationRejected { .. } => "calibration_rejected",
            ScaleError::MalformedPacket(_) => "malformed_packet",
            ScaleError::UnknownCommand(_) => "unknown_command",
            ScaleError::InvalidPayload(_) => "invalid_payload",
            ScaleError::UnknownCharacteristic(_) => "unknown_characteristic",
        }
    }
}

impl std::fmt::Display for ScaleError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ScaleError::CalibrationRejected { raw_weight } => write!(
                f,
                "Cannot calibrate: weight too low ({:.1}g, need more than {:.0}g)",
                raw_weight, CALIBRATION_MIN_RAW_WEIGHT_G
            ),
            ScaleError::MalformedPacket(msg) => write!(f, "Malformed packet: {}", msg),
            ScaleError::UnknownCommand(name) => write!(f, "Unknown command: {}", name),
            ScaleError::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            ScaleError::UnknownCharacteristic(id) => write!(f, "Unknown characteristic: {}", id),
        }
    }
}

impl std::error::Error for ScaleError {}

/// Simulated load cell. Display weight is always derived from the raw
/// reading, the tare baseline and the calibration factor.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleState {
    raw_weight: f32,
    tare_offset: f32,
    calibration_factor: f32,
    battery_level: u8,
    stable: bool,
    unit: WeightUnit,
    error_code: u8,
}

impl Default for ScaleState {
    fn default() -> Self {
        Self {
            raw_weight: 0.0,
            tare_offset: 0.0,
            calibration_factor: 1.0,
            battery_level: DEFAULT_BATTERY_PERCENT,
            stable: true,
            unit: WeightUnit::Grams,
            error_code: ERROR_NONE,
        }
    }
}

impl ScaleState {
    pub fn new(battery_level: u8, unit: WeightUnit) -> Self {
        let mut state = Self {
            unit,
            ..Self::default()
        };
        state.set_battery(battery_level);
        state
    }

    pub fn raw_weight(&self) -> f32 {
        self.raw_weight
    }

    pub fn tare_offset(&self) -> f32 {
        self.tare_offset
    }

    pub fn calibration_factor(&self) -> f32 {
        self.calibration_factor
    }

    pub fn battery_level(&self) -> u8 {
        self.battery_level
    }

    pub fn is_stable(&self) -> bool {
        self.stable
    }

    pub fn unit(&self) -> WeightUnit {
        self.unit
    }

    pub fn error_code(&self) -> u8 {
        self.error_code
    }

    pub fn display_weight(&self) -> f32 {
        (self.raw_weight - self.tare_offset) * self.calibration_factor
    }

    pub fn set_raw_weight(&mut self, grams: f32) {
        // NaN compares false against everything, treat it as an empty pan
        self.raw_weight = if grams > 0.0 { grams } else { 0.0 };
    }

    pub fn tare(&mut self) {
        self.tare_offset = self.raw_weight;
    }

    pub fn calibrate(&mut self, known_weight: f32) -> Result<f32, ScaleError> {
        if !known_weight.is_finite() {
            return Err(ScaleError::InvalidPayload(format!(
                "calibration weight must be finite, got {}",
                known_weight
            )));
        }
        if self.raw_weight <= CALIBRATION_MIN_RAW_WEIGHT_G {
            return Err(ScaleError::CalibrationRejected {
                raw_weight: self.raw_weight,
            });
        }
        self.calibration_factor = known_weight / self.raw_weight;
        Ok(self.calibration_factor)
    }

    pub fn set_battery(&mut self, level: u8) {
        self.battery_level = level.min(MAX_BATTERY_PERCENT);
    }

    pub fn set_stable(&mut self, stable: bool) {
        self.stable = stable;
    }

    pub fn set_error_code(&mut self, code: u8) {
        self.error_code = code;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_emulator() {
        let state = ScaleState::default();
        assert_eq!(state.calibration_factor(), 1.0);
        assert_eq!(state.battery_level(), 85);
        assert!(state.is_stable());
        assert_eq!(state.unit(), WeightUnit::Grams);
        assert_eq!(state.error_code(), ERROR_NONE);
        assert_eq!(state.display_weight(), 0.0);
    }

    #[test]
    fn test_raw_weight_is_clamped() {
        let mut state = ScaleState::default();
        state.set_raw_weight(-25.0);
        assert_eq!(state.raw_weight(), 0.0);
        state.set_raw_weight(f32::NAN);
        assert_eq!(state.raw_weight(), 0.0);
        state.set_raw_weight(42.5);
        assert_eq!(state.raw_weight(), 42.5);
    }

    #[test]
    fn test_tare_then_add_weight() {
        let mut state = ScaleState::default();
        state.set_raw_weight(500.0);
        state.tare();
        state.set_raw_weight(650.0);
        assert!((state.display_weight() - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_tare_zeroes_display_weight() {
        let mut state = ScaleState::default();
        state.set_raw_weight(300.0);
        state.calibrate(150.0).unwrap();
        state.set_raw_weight(812.3);
        state.tare();
        assert_eq!(state.display_weight(), 0.0);
    }

    #[test]
    fn test_calibration_rejected_when_light() {
        let mut state = ScaleState::default();
        state.set_raw_weight(10.0);
        let before = state.clone();

        let result = state.calibrate(100.0);
        assert!(matches!(result, Err(ScaleError::CalibrationRejected { .. })));
        assert_eq!(state, before);
    }

    #[test]
    fn test_calibration_sets_factor() {
        let mut state = ScaleState::default();
        state.set_raw_weight(400.0);
        let factor = state.calibrate(200.0).unwrap();
        assert!((factor - 0.5).abs() < 1e-6);
        assert!((state.display_weight() - 200.0).abs() < 1e-4);
    }

    #[test]
    fn test_calibration_rejects_non_finite_weight() {
        let mut state = ScaleState::default();
        state.set_raw_weight(400.0);
        let before = state.clone();

        for weight in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            assert!(matches!(state.calibrate(weight), Err(ScaleError::InvalidPayload(_))));
            assert_eq!(state, before);
        }
        state.tare();
        assert_eq!(state.display_weight(), 0.0);
    }

    #[test]
    fn test_battery_is_clamped() {
        let mut state = ScaleState::new(250, WeightUnit::Ounces);
        assert_eq!(state.battery_level(), 100);
        state.set_battery(12);
        assert_eq!(state.battery_level(), 12);
    }

    #[test]
    fn test_unit_codes() {
        for unit in [
            WeightUnit::Grams,
            WeightUnit::Kilograms,
            WeightUnit::Pounds,
            WeightUnit::Ounces,
        ] {
            assert_eq!(WeightUnit::from_code(unit.code()), Some(unit));
        }
        assert_eq!(WeightUnit::from_code(4), None);
        assert_eq!(WeightUnit::Pounds.symbol(), "lb");
    }
}
