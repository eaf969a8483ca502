//! Error types and result definitions for the tuya-razer crate.
//! Includes conversions from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors raised by the local protocol engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TuyaError {
    /// Standard IO error (socket creation, write, file store, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Authentication tag did not verify (wrong key, tampered header or body)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a message for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// The payload received from the device was malformed or unexpected
    #[error("Invalid payload")]
    InvalidPayload,

    /// The packet header or tail magic was invalid
    #[error("Invalid header")]
    InvalidHeader,

    /// Failed to decode hex or binary data
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Negotiation reply could not be verified
    #[error("Handshake failed")]
    HandshakeFailed,

    /// Pairing secret or session key has the wrong shape
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Device IP could not be turned into a broadcast address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Device ID already exists in registry
    #[error("Device ID '{0}' already exists")]
    DuplicateDevice(String),

    /// Device ID not found in registry
    #[error("Device ID '{0}' not found")]
    DeviceNotFound(String),
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

impl From<hex::FromHexError> for TuyaError {
    fn from(err: hex::FromHexError) -> Self {
        TuyaError::DecodeError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_keep_the_source_message() {
        let io = TuyaError::from(std::io::Error::other("network down"));
        assert_eq!(io, TuyaError::Io("network down".into()));
        assert_eq!(io.to_string(), "IO error: network down");

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(TuyaError::from(json), TuyaError::Json(_)));

        let hex = hex::decode("zz").unwrap_err();
        assert!(matches!(TuyaError::from(hex), TuyaError::DecodeError(_)));
    }
}
