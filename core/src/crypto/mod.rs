// Cryptography module: session AEAD and the pluggable handshake provider

pub mod provider;
pub mod session;

pub use provider::{
    CcmProvider, CryptoProvider, SessionInfo, BLE_PIN_SIZE, CHALLENGE_INPUT_SIZE,
    CHALLENGE_RANDOM_SIZE, CHALLENGE_RESPONSE_SIZE, EPHEMERAL_KEY_SIZE, HANDSHAKE_NONCE_SIZE,
    SESSION_INFO_BLOCK_SIZE,
};
pub use session::{
    build_nonce, CryptoSession, PacketType, SessionKeys, IV_SIZE, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};

use thiserror::Error;

/// Errors for the crypto context; every one of them ends the session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Authentication failed for {0:?} packet")]
    AuthenticationFailed(PacketType),

    #[error("Handshake payload failed authentication")]
    HandshakeAuthenticationFailed,

    #[error("Replayed {packet_type:?} sequence {sequence} (last accepted {last})")]
    Replay {
        packet_type: PacketType,
        sequence: u16,
        last: u16,
    },

    #[error("Outbound sequence counter exhausted")]
    SequenceExhausted,

    #[error("Session invalidated by an earlier failure")]
    SessionInvalidated,

    #[error("Peer confirmation values do not match")]
    ConfirmationMismatch,

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("Invalid {what} length: expected {expected}, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Cipher failure: {0}")]
    Cipher(String),
}
