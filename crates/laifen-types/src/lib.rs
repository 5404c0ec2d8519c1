//! Protocol types for Laifen BLE toothbrushes.
//!
//! This crate is transport-agnostic: it knows how to validate and decode the
//! status frame the toothbrush sends, how to encode the commands it accepts,
//! and which UUIDs and advertised names identify it. BLE I/O lives in
//! laifen-core.
//!
//! # Example
//!
//! ```
//! use laifen_types::{Command, FrameDecoder, RunStatus};
//!
//! let frame = hex_frame();
//! let reading = FrameDecoder::default().decode(&frame);
//! assert_eq!(reading.status(), RunStatus::Running);
//! assert_eq!(Command::TurnOff.encode(), [0xAA, 0x0F, 0x01, 0x01, 0x00, 0xA5]);
//!
//! # fn hex_frame() -> Vec<u8> {
//! #     let mut f = vec![0u8; 26];
//! #     f[..4].copy_from_slice(&[0xAA, 0x0A, 0x02, 0x15]);
//! #     f[23] = 0x01;
//! #     f
//! # }
//! ```

pub mod command;
pub mod error;
pub mod frame;
pub mod types;
pub mod uuid;

pub use command::Command;
pub use error::{ParseError, ParseResult};
pub use frame::{FrameDecoder, FrameOptions, decode, decode_hex};
pub use types::{
    DeviceIdentity, NAME_PREFIXES, Reading, RunStatus, Telemetry, is_toothbrush_name,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_identity_normalizes() {
        let a = DeviceIdentity::new(" aa:bb:cc:dd:ee:ff ");
        let b = DeviceIdentity::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(a.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_toothbrush_name_filter() {
        assert!(is_toothbrush_name("LFTB-1234"));
        assert!(is_toothbrush_name("Laifen Toothbrush"));
        assert!(!is_toothbrush_name("lftb-1234"));
        assert!(!is_toothbrush_name("Mi Smart Band 7"));
        assert!(!is_toothbrush_name(""));
    }

    #[test]
    fn test_reading_accessors() {
        let telemetry = Telemetry {
            status: RunStatus::Idle,
            mode: 2,
            vibration_strength: 1,
            oscillation_range: 2,
            oscillation_speed: 3,
            battery_level: 90,
            brushing_time_seconds: 150,
            captured_at: None,
            raw: String::new(),
        };
        let reading = Reading::from(telemetry.clone());

        assert!(!reading.is_unknown());
        assert_eq!(reading.status(), RunStatus::Idle);
        assert_eq!(reading.telemetry(), Some(&telemetry));
        assert!((telemetry.brushing_time() - 2.5).abs() < f64::EPSILON);
        assert!(!telemetry.is_running());
    }

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Running.to_string(), "Running");
        assert_eq!(RunStatus::Idle.to_string(), "Idle");
        assert_eq!(RunStatus::default(), RunStatus::Unknown);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_telemetry_serde_roundtrip() {
        let telemetry = Telemetry {
            status: RunStatus::Running,
            mode: 1,
            vibration_strength: 3,
            oscillation_range: 2,
            oscillation_speed: 1,
            battery_level: 50,
            brushing_time_seconds: 60,
            captured_at: Some(time::OffsetDateTime::UNIX_EPOCH),
            raw: "aa0a0215".to_string(),
        };

        let json = serde_json::to_string(&telemetry).unwrap();
        assert!(json.contains("\"status\":\"running\""));
        let back: Telemetry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, telemetry);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_device_identity_serializes_as_string() {
        let id = DeviceIdentity::new("aa:bb");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"AA:BB\"");
    }
}
