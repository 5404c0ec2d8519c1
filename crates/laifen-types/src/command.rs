//! Commands written to the toothbrush.
//!
//! Commands are fixed 6-byte opcodes with no parameters. They are not frames:
//! the toothbrush never echoes them back in the status layout.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Opcode that starts the motor.
pub const TURN_ON: [u8; 6] = [0xAA, 0x0F, 0x01, 0x01, 0x01, 0xA4];

/// Opcode that stops the motor.
pub const TURN_OFF: [u8; 6] = [0xAA, 0x0F, 0x01, 0x01, 0x00, 0xA5];

/// A command understood by the toothbrush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Command {
    /// Start brushing.
    TurnOn,
    /// Stop brushing.
    TurnOff,
}

impl Command {
    /// Wire bytes for this command.
    #[must_use]
    pub fn encode(self) -> [u8; 6] {
        match self {
            Command::TurnOn => TURN_ON,
            Command::TurnOff => TURN_OFF,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::TurnOn => write!(f, "turn on"),
            Command::TurnOff => write!(f, "turn off"),
        }
    }
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "turn_on" | "turn-on" => Ok(Command::TurnOn),
            "off" | "turn_off" | "turn-off" => Ok(Command::TurnOff),
            other => Err(ParseError::InvalidCommand(other.to_string())),
        }
    }
}
