//! Error types for laifen-core.
//!
//! Most failures on a toothbrush link are expected: the device sleeps between
//! brushing sessions and drops off the air. Errors are therefore classified by
//! how the session layer reacts to them rather than by where they came from.
//!
//! | Error | Reaction |
//! |-------|----------|
//! | [`Error::Timeout`] | Retried within the current attempt batch |
//! | [`Error::Bluetooth`] | Retried, then the device is classified asleep |
//! | [`Error::NotConnected`] | Reconnect batch, then asleep |
//! | [`Error::ConnectionFailed`] | Retried with a fixed interval |
//! | [`Error::WriteFailed`] | Reported to the caller as `false` |
//! | [`Error::AlreadySubscribed`] | Treated as success by the link |
//! | [`Error::Parse`] | Frame dropped, previous reading kept |
//! | [`Error::Persistence`] | Logged, in-memory state still updated |
//! | [`Error::DeviceNotFound`] | Not retried |
//! | [`Error::CharacteristicNotFound`] | Not retried, wrong firmware or device |
//! | [`Error::Cancelled`] | Not retried, shutdown in progress |
//! | [`Error::InvalidConfig`] | Not retried, fix configuration and restart |
//!
//! [`Error::is_retryable`] encodes the left half of this table and is what
//! [`crate::with_retry`] consults between attempts.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when talking to a toothbrush.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection failed with specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// Write operation failed.
    #[error("Write failed to characteristic {uuid}: {reason}")]
    WriteFailed {
        /// The characteristic UUID.
        uuid: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Notifications are already enabled on the characteristic.
    #[error("Notifications are already enabled")]
    AlreadySubscribed,

    /// A frame could not be decoded.
    #[error(transparent)]
    Parse(#[from] laifen_types::ParseError),

    /// The snapshot store failed.
    #[error("Snapshot store error: {0}")]
    Persistence(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// Device is out of range or asleep.
    OutOfRange,
    /// Connection attempt timed out.
    Timeout,
    /// Generic BLE error.
    BleError(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::OutOfRange => write!(f, "device out of range"),
            Self::Timeout => write!(f, "connection timed out"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with specified address not found.
    NotFound { identifier: String },
    /// Scan timed out before finding device.
    ScanTimeout { duration: Duration },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::ScanTimeout { duration } => write!(f, "scan timed out after {:?}", duration),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a write failure.
    pub fn write_failed(uuid: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            uuid: uuid.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a snapshot store error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Returns `true` if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Bluetooth(_) => true,
            Error::ConnectionFailed { reason, .. } => !matches!(
                reason,
                ConnectionFailureReason::AdapterUnavailable
            ),
            Error::NotConnected => true,
            Error::WriteFailed { .. } => true,
            Error::AlreadySubscribed => false,
            Error::Parse(_) => false,
            Error::Persistence(_) => false,
            Error::DeviceNotFound(_) => false,
            Error::CharacteristicNotFound { .. } => false,
            Error::Cancelled => false,
            Error::InvalidConfig(_) => false,
        }
    }
}

/// Result type alias using laifen-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
