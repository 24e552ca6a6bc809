use crate::state::StateManager;
use crate::types::{ScaleError, ScaleState};
use log::{debug, info, warn};
use serde_json::Value;

/// Control commands accepted from remote clients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScaleCommand {
    Tare,
    Calibrate { weight: f32 },
    SetWeight { weight: f32 },
}

impl ScaleCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ScaleCommand::Tare => "tare",
            ScaleCommand::Calibrate { .. } => "calibrate",
            ScaleCommand::SetWeight { .. } => "set_weight",
        }
    }

    /// Decodes a structured message such as `{"command":"calibrate","weight":200}`.
    pub fn from_json(text: &str) -> Result<Self, ScaleError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ScaleError::InvalidPayload(format!("not JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, ScaleError> {
        let object = value
            .as_object()
            .ok_or_else(|| ScaleError::InvalidPayload("expected a JSON object".to_string()))?;

        let name = object
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ScaleError::InvalidPayload("missing \"command\" field".to_string()))?;

        match name {
            "tare" => Ok(ScaleCommand::Tare),
            "calibrate" => {
                let weight = weight_field(value)?;
                if weight <= 0.0 {
                    return Err(ScaleError::InvalidPayload(format!(
                        "calibration weight must be positive, got {}",
                        weight
                    )));
                }
                Ok(ScaleCommand::Calibrate { weight })
            }
            "set_weight" => Ok(ScaleCommand::SetWeight {
                weight: weight_field(value)?,
            }),
            other => Err(ScaleError::UnknownCommand(other.to_string())),
        }
    }
}

fn weight_field(value: &Value) -> Result<f32, ScaleError> {
    let weight = value
        .get("weight")
        .and_then(Value::as_f64)
        .ok_or_else(|| ScaleError::InvalidPayload("missing numeric \"weight\" field".to_string()))?
        as f32;
    if !weight.is_finite() {
        return Err(ScaleError::InvalidPayload("weight out of range".to_string()));
    }
    Ok(weight)
}

/// Applies commands to the shared scale state. A successful command is picked
/// up by the next broadcast tick without any extra notification.
#[derive(Clone)]
pub struct CommandDispatcher {
    state: StateManager,
}

impl CommandDispatcher {
    pub fn new(state: StateManager) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub async fn dispatch(&self, command: ScaleCommand) -> Result<ScaleState, ScaleError> {
        debug!("Dispatching command: {:?}", command);

        let result = self
            .state
            .update(|state| match command {
                ScaleCommand::Tare => {
                    state.tare();
                    Ok(())
                }
                ScaleCommand::Calibrate { weight } => state.calibrate(weight).map(|_| ()),
                ScaleCommand::SetWeight { weight } => {
                    state.set_raw_weight(weight);
                    Ok(())
                }
            })
            .await;

        match &result {
            Ok(state) => info!(
                "{} applied: raw {:.1}g -> display {:.1}g (factor {:.4})",
                command.name(),
                state.raw_weight(),
                state.display_weight(),
                state.calibration_factor()
            ),
            Err(e) => warn!("{} rejected: {}", command.name(), e),
        }
        result
    }

    pub async fn dispatch_json(&self, text: &str) -> Result<ScaleState, ScaleError> {
        let command = ScaleCommand::from_json(text)?;
        self.dispatch(command).await
    }

    // Operator-only controls, not reachable from remote transports

    pub async fn set_battery(&self, level: u8) -> ScaleState {
        let state = self.state.modify(|state| state.set_battery(level)).await;
        info!("Battery: {}%", state.battery_level());
        state
    }

    pub async fn toggle_stability(&self) -> ScaleState {
        let state = self
            .state
            .modify(|state| state.set_stable(!state.is_stable()))
            .await;
        info!(
            "Stability: {}",
            if state.is_stable() { "Stable" } else { "Unstable" }
        );
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    fn dispatcher() -> (CommandDispatcher, StateManager) {
        let state = StateManager::default();
        (CommandDispatcher::new(state.clone()), state)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(ScaleCommand::from_json(r#"{"command":"tare"}"#), Ok(ScaleCommand::Tare));
        assert_eq!(
            ScaleCommand::from_json(r#"{"command":"calibrate","weight":200}"#),
            Ok(ScaleCommand::Calibrate { weight: 200.0 })
        );
        assert_eq!(
            ScaleCommand::from_json(r#"{"command":"set_weight","weight":-3.5}"#),
            Ok(ScaleCommand::SetWeight { weight: -3.5 })
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            ScaleCommand::from_json(r#"{"command":"reboot"}"#),
            Err(ScaleError::UnknownCommand("reboot".to_string()))
        );
    }

    #[test]
    fn test_invalid_payloads() {
        for text in [
            "not json",
            "[1, 2]",
            r#"{"weight": 5}"#,
            r#"{"command": 7}"#,
            r#"{"command":"set_weight"}"#,
            r#"{"command":"set_weight","weight":"heavy"}"#,
            r#"{"command":"calibrate"}"#,
            r#"{"command":"calibrate","weight":0}"#,
            r#"{"command":"set_weight","weight":1e300}"#,
        ] {
            let result = ScaleCommand::from_json(text);
            assert!(
                matches!(result, Err(ScaleError::InvalidPayload(_))),
                "{} -> {:?}",
                text,
                result
            );
        }
    }

    #[test]
    fn test_dispatch_returns_snapshot() {
        let (dispatcher, _) = dispatcher();
        block_on(dispatcher.dispatch(ScaleCommand::SetWeight { weight: 500.0 })).unwrap();
        block_on(dispatcher.dispatch(ScaleCommand::Tare)).unwrap();
        let state = block_on(dispatcher.dispatch(ScaleCommand::SetWeight { weight: 650.0 })).unwrap();
        assert!((state.display_weight() - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_dispatch_propagates_calibration_rejection() {
        let (dispatcher, state) = dispatcher();
        block_on(dispatcher.dispatch(ScaleCommand::SetWeight { weight: 8.0 })).unwrap();

        let result = block_on(dispatcher.dispatch_json(r#"{"command":"calibrate","weight":100}"#));
        assert!(matches!(result, Err(ScaleError::CalibrationRejected { .. })));
        assert_eq!(block_on(state.snapshot()).calibration_factor(), 1.0);
    }

    #[test]
    fn test_dispatch_visible_to_other_handles() {
        let (dispatcher, state) = dispatcher();
        block_on(dispatcher.dispatch_json(r#"{"command":"set_weight","weight":300}"#)).unwrap();
        block_on(dispatcher.dispatch_json(r#"{"command":"calibrate","weight":150}"#)).unwrap();
        assert!((block_on(state.get_display_weight()) - 150.0).abs() < 1e-4);
    }

    #[test]
    fn test_operator_controls() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(block_on(dispatcher.set_battery(130)).battery_level(), 100);
        assert!(!block_on(dispatcher.toggle_stability()).is_stable());
        assert!(block_on(dispatcher.toggle_stability()).is_stable());
    }
}
