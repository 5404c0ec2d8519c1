//! Error types for frame decoding in laifen-types.

use thiserror::Error;

/// Errors that can occur when decoding a toothbrush frame or a command name.
///
/// This error type is transport-agnostic; BLE failures belong in laifen-core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The frame does not start with the configured preamble.
    #[error("frame does not start with preamble {expected}")]
    InvalidPreamble {
        /// The preamble the decoder was configured with.
        expected: String,
    },

    /// The frame is too short to address every field of its active mode.
    #[error("frame too short: requires {expected} hex characters, got {actual}")]
    TooShort {
        /// Minimum hex length required.
        expected: usize,
        /// Hex length actually received.
        actual: usize,
    },

    /// The frame contains a character that is not a hex digit.
    #[error("frame contains non-hex characters")]
    InvalidHex,

    /// A command name was not recognised.
    #[error("unknown command '{0}', expected 'on' or 'off'")]
    InvalidCommand(String),
}

/// Result type alias using laifen-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
