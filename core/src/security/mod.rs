// Security module: pairing and reconnection handshake on the security service

pub mod commands;
pub mod handshake;

pub use commands::{
    application_certificate, stream_for_size, SecurityCommand, SecurityEvent,
    APPLICATION_CERTIFICATE_SIZE,
};
pub use handshake::{
    Handshake, HandshakeAction, HandshakeError, HandshakeState, DATA_NOTIFICATIONS,
    SECURITY_NOTIFICATIONS,
};
