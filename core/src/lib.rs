// cgmlink core: BLE protocol engine for Libre 3 class glucose sensors
//
// The platform owns the radio (scan, connect, discovery). This crate owns everything
// between raw GATT notifications and decoded glucose records: reassembly, the
// security handshake, the encrypted session and the record layouts.

pub mod config;
pub mod control;
pub mod crypto;
pub mod nfc;
pub mod security;
pub mod session;
pub mod sim;
pub mod telemetry;
pub mod transport;

use thiserror::Error;

pub use config::{ConfigError, SessionConfig};
pub use control::{ControlCommand, ControlError};
pub use crypto::{CcmProvider, CryptoError, CryptoProvider, CryptoSession, PacketType};
pub use security::{HandshakeError, HandshakeState, SecurityCommand, SecurityEvent};
pub use session::{LinkEvent, LinkSession};
pub use telemetry::{DecodeError, RecordKind, TelemetryRecord};
pub use transport::{
    Characteristic, GattError, GattLink, LinkRequest, ReassemblyError, WriterError,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Every failure the engine reports
///
/// Fatal errors ([`LinkError::is_fatal`]) have already torn the session down and
/// queued a [`LinkRequest::Disconnect`] by the time the caller sees them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Buffer overrun or an unexpected completion boundary
    #[error("Protocol desync: {0}")]
    ProtocolDesync(#[from] ReassemblyError),

    /// Unrecognized response-size hint
    #[error("Unknown stream size hint: {0}")]
    UnknownStreamSize(u8),

    /// AEAD failure, replay or counter exhaustion
    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Platform write or subscribe failure, retryable
    #[error("Transport failure: {0}")]
    Transport(#[from] GattError),

    /// Outbound queue failure (backpressure, stray completion)
    #[error("Write queue: {0}")]
    Writer(#[from] WriterError),

    #[error("No answer from the sensor within the response timeout")]
    Timeout,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Control channel: {0}")]
    Control(ControlError),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl LinkError {
    /// Fatal errors end the session and require a new handshake
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::ProtocolDesync(_)
                | LinkError::UnknownStreamSize(_)
                | LinkError::Crypto(_)
                | LinkError::Timeout
                | LinkError::Control(ControlError::IdsExhausted)
        )
    }
}

impl From<HandshakeError> for LinkError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::UnknownStreamSize(size) => LinkError::UnknownStreamSize(size),
            HandshakeError::Crypto(e) => LinkError::Crypto(e),
            HandshakeError::UnknownSecurityVersion(v) => {
                LinkError::Config(ConfigError::UnknownSecurityVersion(v))
            }
            e @ HandshakeError::InvalidState { .. } => LinkError::InvalidState(e.to_string()),
        }
    }
}

impl From<ControlError> for LinkError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Crypto(e) => LinkError::Crypto(e),
            other => LinkError::Control(other),
        }
    }
}
