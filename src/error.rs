//! Error types and result definitions for the tuyalan crate.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Tuya device.
#[derive(Error, Debug, Clone)]
pub enum TuyaError {
    /// Standard IO error (network, timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Failed to decrypt a message from the device (wrong key or version)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// DNS resolution or TCP connect exceeded the configured timeout
    #[error("Timeout waiting for device")]
    Timeout,

    /// CRC check failed for the received message
    #[error("CRC mismatch")]
    CrcMismatch,

    /// TCP connection could not be established
    #[error("Socket connection failed")]
    ConnectionFailed,

    /// The message header was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// Failed to decode hex or base64 data
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// An operation required an active connection but none exists
    #[error("Not connected to device")]
    NotConnected,

    /// `connect` was called on a session that is already connected
    #[error("Already connected to device")]
    AlreadyConnected,

    /// A control operation was attempted before the first status query completed
    #[error("Device state unknown (no DPS received yet)")]
    StateUnknown,

    /// The local key is not exactly 16 bytes long
    #[error("Local key length should be 16 characters")]
    InvalidKeyLength,

    /// The requested protocol version is not supported
    #[error("Unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    /// A value passed to a setter is outside its accepted range
    #[error("{name} value {value} is out of bounds (0-{max})")]
    OutOfRange {
        name: &'static str,
        value: i64,
        max: i64,
    },
}

/// A specialized Result type for Tuya operations.
pub type Result<T> = std::result::Result<T, TuyaError>;

impl From<std::io::Error> for TuyaError {
    fn from(err: std::io::Error) -> Self {
        TuyaError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TuyaError {
    fn from(err: serde_json::Error) -> Self {
        TuyaError::Json(err.to_string())
    }
}
