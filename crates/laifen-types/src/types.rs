//! Core types for Laifen toothbrush telemetry.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Advertised name prefixes used by Laifen toothbrushes.
///
/// Current firmware advertises `LFTB...`; early units used the long form.
pub const NAME_PREFIXES: [&str; 2] = ["LFTB", "Laifen Toothbrush"];

/// Returns `true` if an advertised BLE name belongs to a Laifen toothbrush.
#[must_use]
pub fn is_toothbrush_name(name: &str) -> bool {
    NAME_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Stable transport address of one physical toothbrush.
///
/// On Linux and Windows this is the MAC address; on macOS it is the
/// CoreBluetooth peripheral UUID. Identities are trimmed and upper-cased so
/// that the same device always maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Create a normalized identity from an address string.
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(address.as_ref().trim().to_ascii_uppercase())
    }

    /// The normalized address.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for DeviceIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Motor state reported by the toothbrush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RunStatus {
    /// The brush head is moving.
    Running,
    /// The brush is awake but not brushing.
    Idle,
    /// No valid frame backs this status.
    #[default]
    Unknown,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "Running"),
            RunStatus::Idle => write!(f, "Idle"),
            RunStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Fully decoded telemetry from one valid frame.
///
/// A `Telemetry` only ever comes out of [`FrameDecoder`](crate::FrameDecoder)
/// after the frame passed validation, so every field is populated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Telemetry {
    /// Motor state; never [`RunStatus::Unknown`] for decoded telemetry.
    pub status: RunStatus,
    /// Active brushing mode, 1-based.
    pub mode: u8,
    /// Vibration strength of the active mode.
    pub vibration_strength: u8,
    /// Oscillation range of the active mode.
    pub oscillation_range: u8,
    /// Oscillation speed of the active mode.
    pub oscillation_speed: u8,
    /// Battery level percentage (0-100).
    pub battery_level: u8,
    /// Length of the current or last brushing session in seconds.
    pub brushing_time_seconds: u16,
    /// Timestamp when the frame was received (if known).
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub captured_at: Option<time::OffsetDateTime>,
    /// Lower-case hex of the frame this telemetry was decoded from.
    pub raw: String,
}

impl Telemetry {
    /// Brushing time in minutes.
    #[must_use]
    pub fn brushing_time(&self) -> f64 {
        f64::from(self.brushing_time_seconds) / 60.0
    }

    /// Returns `true` while the motor is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Set the capture timestamp.
    #[must_use]
    pub fn with_captured_at(mut self, at: time::OffsetDateTime) -> Self {
        self.captured_at = Some(at);
        self
    }
}

/// Outcome of decoding one frame.
///
/// `Option<Reading>` distinguishes "no frame at all" (`None`) from
/// "frame present but unparseable" (`Some(Reading::Unknown { .. })`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reading {
    /// The frame passed validation.
    Valid(Telemetry),
    /// The frame was present but could not be trusted.
    Unknown {
        /// Hex of the rejected frame, for diagnostics.
        raw: String,
        /// Why validation failed.
        reason: ParseError,
    },
}

impl Reading {
    /// Run status, or [`RunStatus::Unknown`] for the sentinel.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        match self {
            Reading::Valid(telemetry) => telemetry.status,
            Reading::Unknown { .. } => RunStatus::Unknown,
        }
    }

    /// Returns `true` for the unknown sentinel.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        matches!(self, Reading::Unknown { .. })
    }

    /// Borrow the telemetry of a valid reading.
    #[must_use]
    pub fn telemetry(&self) -> Option<&Telemetry> {
        match self {
            Reading::Valid(telemetry) => Some(telemetry),
            Reading::Unknown { .. } => None,
        }
    }

    /// Take the telemetry of a valid reading.
    #[must_use]
    pub fn into_telemetry(self) -> Option<Telemetry> {
        match self {
            Reading::Valid(telemetry) => Some(telemetry),
            Reading::Unknown { .. } => None,
        }
    }
}

impl From<Telemetry> for Reading {
    fn from(value: Telemetry) -> Self {
        Reading::Valid(value)
    }
}
