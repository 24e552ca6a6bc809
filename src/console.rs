//! Operator console for driving the emulated scale from stdin.

use crate::commands::{CommandDispatcher, ScaleCommand};
use crate::types::{ScaleState, MAX_BATTERY_PERCENT};
use embassy_futures::block_on;
use log::warn;
use std::io::{BufRead, Write};

pub const HELP: &str = "\
Commands:
  w <grams>  set weight (e.g. w 150.5)
  t          tare
  c <grams>  calibrate against a known weight
  b <level>  set battery (e.g. b 75)
  s          toggle stability
  q          quit";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    Scale(ScaleCommand),
    Battery(u8),
    ToggleStability,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one console line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim().to_lowercase();
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Ok(None);
        };
        let arg = parts.next();

        let command = match (cmd, arg) {
            ("w", Some(arg)) => ConsoleCommand::Scale(ScaleCommand::SetWeight {
                weight: parse_grams(arg)?,
            }),
            ("c", Some(arg)) => {
                let weight = parse_grams(arg)?;
                if weight <= 0.0 {
                    return Err("Calibration weight must be positive".to_string());
                }
                ConsoleCommand::Scale(ScaleCommand::Calibrate { weight })
            }
            ("t", _) => ConsoleCommand::Scale(ScaleCommand::Tare),
            ("b", Some(arg)) => {
                let level: i64 = arg
                    .parse()
                    .map_err(|_| format!("Invalid battery value: {}", arg))?;
                ConsoleCommand::Battery(level.clamp(0, MAX_BATTERY_PERCENT as i64) as u8)
            }
            ("s", _) => ConsoleCommand::ToggleStability,
            ("h" | "help" | "?", _) => ConsoleCommand::Help,
            ("q" | "quit", _) => ConsoleCommand::Quit,
            ("w" | "c" | "b", None) => return Err(format!("'{}' needs a value", cmd)),
            _ => return Err(format!("Unknown command: {}", cmd)),
        };
        Ok(Some(command))
    }
}

fn parse_grams(arg: &str) -> Result<f32, String> {
    arg.parse::<f32>()
        .ok()
        .filter(|weight| weight.is_finite())
        .ok_or_else(|| format!("Invalid weight: {}", arg))
}

pub fn describe(state: &ScaleState) -> String {
    format!(
        "Weight: {:.1}{} (raw {:.1}g, factor {:.4}) | Battery: {}% | {}",
        state.display_weight(),
        state.unit().symbol(),
        state.raw_weight(),
        state.calibration_factor(),
        state.battery_level(),
        if state.is_stable() { "Stable" } else { "Unstable" }
    )
}

/// Reads commands until `q` or end of input. Every applied command echoes
/// the resulting state to `output`; invalid lines are reported and skipped.
pub fn run<R: BufRead, W: Write>(
    dispatcher: &CommandDispatcher,
    input: R,
    mut output: W,
) -> std::io::Result<()> {
    writeln!(output, "{}", HELP)?;

    for line in input.lines() {
        let line = line?;
        let command = match ConsoleCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(msg) => {
                warn!("Console: {}", msg);
                writeln!(output, "{}", msg)?;
                continue;
            }
        };

        let reply = match command {
            ConsoleCommand::Scale(cmd) => match block_on(dispatcher.dispatch(cmd)) {
                Ok(state) => describe(&state),
                Err(e) => e.to_string(),
            },
            ConsoleCommand::Battery(level) => describe(&block_on(dispatcher.set_battery(level))),
            ConsoleCommand::ToggleStability => describe(&block_on(dispatcher.toggle_stability())),
            ConsoleCommand::Help => HELP.to_string(),
            ConsoleCommand::Quit => break,
        };
        writeln!(output, "{}", reply)?;
    }
    Ok(())
}
