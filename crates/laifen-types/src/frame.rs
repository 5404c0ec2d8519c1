//! Decoder for the toothbrush status frame.
//!
//! Frames are addressed by offsets into their lower-case hex form, two hex
//! characters per byte:
//!
//! | Hex offset        | Field                                    |
//! |-------------------|------------------------------------------|
//! | 0..8              | preamble `aa0a0215`                      |
//! | 9 (nibble)        | active mode index `m` (0-based)          |
//! | 10+6m .. 12+6m    | vibration strength of mode `m`           |
//! | 12+6m .. 14+6m    | oscillation range of mode `m`            |
//! | 14+6m .. 16+6m    | oscillation speed of mode `m`            |
//! | 36..38            | battery level percent                    |
//! | 40..44            | brushing time in seconds (big endian)    |
//! | 47 (nibble)       | run status, `1` = running                |
//!
//! Firmware revisions disagree on the exact preamble and minimum length, so
//! both live in [`FrameOptions`].

use crate::error::{ParseError, ParseResult};
use crate::types::{Reading, RunStatus, Telemetry};

/// Preamble sent by current firmware.
pub const DEFAULT_PREAMBLE: &str = "aa0a0215";

/// Shorter preamble accepted by later protocol revisions.
pub const LENIENT_PREAMBLE: &str = "aa0a021";

/// Default minimum frame length in hex characters.
pub const DEFAULT_MIN_HEX_LEN: usize = 50;

/// Hex length needed to reach the run-status nibble at offset 47.
pub const MIN_LAYOUT_HEX_LEN: usize = 48;

const MODE_OFFSET: usize = 9;
const MODE_BLOCK_START: usize = 10;
const MODE_BLOCK_STRIDE: usize = 6;
const BATTERY_OFFSET: usize = 36;
const BRUSHING_TIME_OFFSET: usize = 40;
const STATUS_OFFSET: usize = 47;

/// Validation parameters for incoming frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameOptions {
    /// Lower-case hex prefix every valid frame starts with.
    pub preamble: String,
    /// Minimum hex length, applied on top of the layout minimum.
    pub min_hex_len: usize,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
            min_hex_len: DEFAULT_MIN_HEX_LEN,
        }
    }
}

impl FrameOptions {
    /// Options for firmware that only guarantees the 7-nibble preamble.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            preamble: LENIENT_PREAMBLE.to_string(),
            min_hex_len: DEFAULT_MIN_HEX_LEN,
        }
    }

    /// Set the preamble. It is compared case-insensitively.
    #[must_use]
    pub fn preamble(mut self, preamble: impl AsRef<str>) -> Self {
        self.preamble = preamble.as_ref().to_ascii_lowercase();
        self
    }

    /// Set the minimum hex length.
    #[must_use]
    pub fn min_hex_len(mut self, len: usize) -> Self {
        self.min_hex_len = len;
        self
    }
}

/// Hex length needed to address every field of mode index `mode_index`.
#[must_use]
pub fn required_hex_len(mode_index: u8) -> usize {
    let mode_end = MODE_BLOCK_START + MODE_BLOCK_STRIDE * usize::from(mode_index) + 6;
    mode_end.max(MIN_LAYOUT_HEX_LEN)
}

/// Validating frame decoder.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    options: FrameOptions,
}

impl FrameDecoder {
    /// Create a decoder with the given options.
    pub fn new(options: FrameOptions) -> Self {
        Self { options }
    }

    /// The options this decoder validates against.
    pub fn options(&self) -> &FrameOptions {
        &self.options
    }

    /// Decode a raw frame, mapping every failure to [`Reading::Unknown`].
    pub fn decode(&self, frame: &[u8]) -> Reading {
        self.decode_hex(&hex::encode(frame))
    }

    /// Decode a frame given as hex text, mapping every failure to [`Reading::Unknown`].
    pub fn decode_hex(&self, hex: &str) -> Reading {
        match self.try_decode_hex(hex) {
            Ok(telemetry) => Reading::Valid(telemetry),
            Err(reason) => Reading::Unknown {
                raw: hex.trim().to_ascii_lowercase(),
                reason,
            },
        }
    }

    /// Returns `true` if the frame passes validation.
    pub fn is_valid(&self, frame: &[u8]) -> bool {
        self.try_decode(frame).is_ok()
    }

    /// Decode a raw frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] describing the first validation failure.
    pub fn try_decode(&self, frame: &[u8]) -> ParseResult<Telemetry> {
        self.try_decode_hex(&hex::encode(frame))
    }

    /// Decode a frame given as hex text.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidHex`] for non-hex input,
    /// [`ParseError::InvalidPreamble`] if the preamble does not match and
    /// [`ParseError::TooShort`] if the frame cannot address its active mode.
    pub fn try_decode_hex(&self, hex: &str) -> ParseResult<Telemetry> {
        let hex = hex.trim().to_ascii_lowercase();
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidHex);
        }
        if !hex.starts_with(&self.options.preamble) {
            return Err(ParseError::InvalidPreamble {
                expected: self.options.preamble.clone(),
            });
        }

        let base_len = self.options.min_hex_len.max(MIN_LAYOUT_HEX_LEN);
        if hex.len() < base_len {
            return Err(ParseError::TooShort {
                expected: base_len,
                actual: hex.len(),
            });
        }

        let mode_index = field(&hex, MODE_OFFSET, 1)? as u8;
        let required = base_len.max(required_hex_len(mode_index));
        if hex.len() < required {
            return Err(ParseError::TooShort {
                expected: required,
                actual: hex.len(),
            });
        }

        let block = MODE_BLOCK_START + MODE_BLOCK_STRIDE * usize::from(mode_index);
        let status = if &hex[STATUS_OFFSET..=STATUS_OFFSET] == "1" {
            RunStatus::Running
        } else {
            RunStatus::Idle
        };

        Ok(Telemetry {
            status,
            mode: mode_index + 1,
            vibration_strength: field(&hex, block, 2)? as u8,
            oscillation_range: field(&hex, block + 2, 2)? as u8,
            oscillation_speed: field(&hex, block + 4, 2)? as u8,
            battery_level: field(&hex, BATTERY_OFFSET, 2)? as u8,
            brushing_time_seconds: field(&hex, BRUSHING_TIME_OFFSET, 4)? as u16,
            captured_at: None,
            raw: hex,
        })
    }
}

/// Parse `width` hex characters at `offset`.
fn field(hex: &str, offset: usize, width: usize) -> ParseResult<u32> {
    let digits = hex.get(offset..offset + width).ok_or(ParseError::TooShort {
        expected: offset + width,
        actual: hex.len(),
    })?;
    u32::from_str_radix(digits, 16).map_err(|_| ParseError::InvalidHex)
}

/// Decode a raw frame with default options.
pub fn decode(frame: &[u8]) -> Reading {
    FrameDecoder::default().decode(frame)
}

/// Decode a hex frame with default options.
pub fn decode_hex(hex: &str) -> Reading {
    FrameDecoder::default().decode_hex(hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 26-byte frame in mode 1, running, 50% battery, 60 s brushing time.
    fn sample_frame() -> Vec<u8> {
        let mut frame = vec![0u8; 26];
        frame[..4].copy_from_slice(&[0xAA, 0x0A, 0x02, 0x15]);
        frame[5] = 0x03; // vibration
        frame[6] = 0x02; // range
        frame[7] = 0x01; // speed
        frame[18] = 0x32; // battery
        frame[20] = 0x00;
        frame[21] = 0x3C; // 60 seconds
        frame[23] = 0x01; // running
        frame
    }

    #[test]
    fn test_decode_running_frame() {
        let reading = decode(&sample_frame());
        let telemetry = reading.telemetry().expect("frame should be valid");

        assert_eq!(telemetry.status, RunStatus::Running);
        assert_eq!(telemetry.mode, 1);
        assert_eq!(telemetry.vibration_strength, 3);
        assert_eq!(telemetry.oscillation_range, 2);
        assert_eq!(telemetry.oscillation_speed, 1);
        assert_eq!(telemetry.battery_level, 50);
        assert_eq!(telemetry.brushing_time_seconds, 60);
        assert!((telemetry.brushing_time() - 1.0).abs() < f64::EPSILON);
        assert_eq!(telemetry.raw.len(), 52);
    }

    #[test]
    fn test_decode_idle_when_status_nibble_not_one() {
        let mut frame = sample_frame();
        frame[23] = 0x02;
        assert_eq!(decode(&frame).status(), RunStatus::Idle);

        frame[23] = 0x10;
        assert_eq!(decode(&frame).status(), RunStatus::Idle);
    }

    #[test]
    fn test_decode_selects_mode_block() {
        let mut frame = sample_frame();
        frame[4] = 0x02; // mode index 2 -> block starts at hex 22 (byte 11)
        frame[11] = 0x07;
        frame[12] = 0x08;
        frame[13] = 0x09;

        let telemetry = decode(&frame).into_telemetry().expect("valid");
        assert_eq!(telemetry.mode, 3);
        assert_eq!(telemetry.vibration_strength, 7);
        assert_eq!(telemetry.oscillation_range, 8);
        assert_eq!(telemetry.oscillation_speed, 9);
    }

    #[test]
    fn test_decode_wrong_preamble_is_unknown() {
        let mut frame = sample_frame();
        frame[3] = 0x16;

        let reading = decode(&frame);
        assert!(reading.is_unknown());
        assert_eq!(reading.status(), RunStatus::Unknown);
        match reading {
            Reading::Unknown { raw, reason } => {
                assert!(raw.starts_with("aa0a0216"));
                assert!(matches!(reason, ParseError::InvalidPreamble { .. }));
            }
            Reading::Valid(_) => panic!("expected unknown"),
        }
    }

    #[test]
    fn test_lenient_preamble_accepts_revision() {
        let mut frame = sample_frame();
        frame[3] = 0x16;

        let decoder = FrameDecoder::new(FrameOptions::lenient());
        assert!(decoder.is_valid(&frame));
        assert!(!FrameDecoder::default().is_valid(&frame));
    }

    #[test]
    fn test_decode_short_frame_is_unknown() {
        let frame = &sample_frame()[..24]; // 48 hex chars < 50
        let reading = decode(frame);
        assert!(matches!(
            reading,
            Reading::Unknown {
                reason: ParseError::TooShort {
                    expected: 50,
                    actual: 48
                },
                ..
            }
        ));
    }

    #[test]
    fn test_min_len_is_configurable() {
        let frame = &sample_frame()[..25]; // 50 hex chars
        assert!(FrameDecoder::default().is_valid(frame));

        let strict = FrameDecoder::new(FrameOptions::default().min_hex_len(52));
        assert!(!strict.is_valid(frame));
        assert!(strict.is_valid(&sample_frame()));
    }

    #[test]
    fn test_high_mode_index_requires_longer_frame() {
        let mut frame = sample_frame();
        frame[4] = 0x07; // block ends at hex 10 + 42 + 6 = 58

        let reading = decode(&frame);
        assert!(matches!(
            reading,
            Reading::Unknown {
                reason: ParseError::TooShort { expected: 58, .. },
                ..
            }
        ));

        frame.extend_from_slice(&[0, 0, 0]);
        assert!(!decode(&frame).is_unknown());
    }

    #[test]
    fn test_decode_hex_rejects_non_hex() {
        let mut hex = hex::encode(sample_frame());
        hex.replace_range(20..21, "z");
        assert!(matches!(
            decode_hex(&hex),
            Reading::Unknown {
                reason: ParseError::InvalidHex,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_hex_is_case_insensitive() {
        let upper = hex::encode_upper(sample_frame());
        assert!(!decode_hex(&upper).is_unknown());
    }

    #[test]
    fn test_decode_empty_is_unknown() {
        assert!(decode(&[]).is_unknown());
        assert!(decode_hex("").is_unknown());
    }

    #[test]
    fn test_required_hex_len() {
        assert_eq!(required_hex_len(0), 48);
        assert_eq!(required_hex_len(3), 48);
        assert_eq!(required_hex_len(6), 52);
        assert_eq!(required_hex_len(15), 106);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn frame_with(mode_index: u8, vibration: u8, range: u8, speed: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 26];
        frame[..4].copy_from_slice(&[0xAA, 0x0A, 0x02, 0x15]);
        frame[4] = mode_index;
        let byte = 5 + 3 * usize::from(mode_index);
        frame[byte] = vibration;
        frame[byte + 1] = range;
        frame[byte + 2] = speed;
        frame
    }

    proptest! {
        /// Mode and per-mode fields come from the computed offsets.
        #[test]
        fn decode_reads_active_mode_block(
            mode_index in 0u8..=3,
            vibration: u8,
            range: u8,
            speed: u8,
        ) {
            let frame = frame_with(mode_index, vibration, range, speed);
            let telemetry = decode(&frame).into_telemetry().expect("valid frame");
            prop_assert_eq!(telemetry.mode, mode_index + 1);
            prop_assert_eq!(telemetry.vibration_strength, vibration);
            prop_assert_eq!(telemetry.oscillation_range, range);
            prop_assert_eq!(telemetry.oscillation_speed, speed);
        }

        /// Decoding arbitrary bytes never panics.
        #[test]
        fn decode_never_panics(data: Vec<u8>) {
            let _ = decode(&data);
        }

        /// Decoding arbitrary text never panics.
        #[test]
        fn decode_hex_never_panics(text in ".*") {
            let _ = decode_hex(&text);
        }

        /// Frames with a foreign preamble are always unknown.
        #[test]
        fn wrong_preamble_is_unknown(mut data in proptest::collection::vec(any::<u8>(), 4..64)) {
            if data[..4] == [0xAA, 0x0A, 0x02, 0x15] {
                data[0] = 0x00;
            }
            prop_assert!(decode(&data).is_unknown());
        }

        /// Frames shorter than the minimum are always unknown.
        #[test]
        fn short_frame_is_unknown(tail in proptest::collection::vec(any::<u8>(), 0..21)) {
            let mut frame = vec![0xAA, 0x0A, 0x02, 0x15];
            frame.extend(tail);
            prop_assert!(decode(&frame).is_unknown());
        }
    }
}
