//! Error types and result definitions for the rustlink crate.
//! Covers transport, protocol, crypto and discovery failure modes.

use thiserror::Error;

/// Represents all possible errors that can occur when communicating with a Broadlink device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadlinkError {
    /// Standard IO error (network, timeout, etc.)
    #[error("IO error: {0}")]
    Io(String),

    /// Request timed out waiting for a datagram
    #[error("Timeout waiting for device")]
    Timeout,

    /// Device reported a non-zero error code at offset 34 of the response
    #[error("Device reported error code {0:#06x}")]
    Protocol(u16),

    /// Failed to decrypt a response (wrong key, bad IV, or corrupt ciphertext)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Failed to encrypt a payload for the device
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Key or IV was not exactly 16 bytes
    #[error("Invalid key or IV length (must be 16 bytes)")]
    InvalidKeyLength,

    /// The packet received from the device was too short or malformed
    #[error("Invalid packet")]
    InvalidPacket,

    /// The authentication handshake failed
    #[error("Handshake failed")]
    HandshakeFailed,

    /// No matching device responded within the discovery window.
    /// A normal negative outcome, not a fault.
    #[error("No device found within the discovery window")]
    DiscoveryTimeout,

    /// Malformed device configuration (bad MAC, key or IV string)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// A specialized Result type for Broadlink operations.
pub type Result<T> = std::result::Result<T, BroadlinkError>;

impl From<std::io::Error> for BroadlinkError {
    fn from(err: std::io::Error) -> Self {
        BroadlinkError::Io(err.to_string())
    }
}

impl From<hex::FromHexError> for BroadlinkError {
    fn from(err: hex::FromHexError) -> Self {
        BroadlinkError::ConfigError(err.to_string())
    }
}
