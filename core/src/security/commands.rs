//! Security characteristic vocabulary: commands, events and stream-size hints

use crate::transport::Characteristic;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the fixed application certificate
pub const APPLICATION_CERTIFICATE_SIZE: usize = 162;

/// Payload size of the patch certificate stream
pub const PATCH_CERTIFICATE_SIZE: u8 = 140;
/// Payload size of the patch ephemeral key stream
pub const PATCH_EPHEMERAL_SIZE: u8 = 65;
/// Payload size of the security challenge stream
pub const CHALLENGE_SIZE: u8 = 23;
/// Payload size of the session info stream
pub const SESSION_INFO_SIZE: u8 = 67;

/// Single-byte command written to the security commands characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SecurityCommand {
    Security01 = 0x01,
    Security02 = 0x02,
    Security03 = 0x03,
    Security09 = 0x09,
    Security0D = 0x0D,
    Security0E = 0x0E,
    GetSessionInfo = 0x08,
    ReadChallenge = 0x11,
}

impl SecurityCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(SecurityCommand::Security01),
            0x02 => Some(SecurityCommand::Security02),
            0x03 => Some(SecurityCommand::Security03),
            0x09 => Some(SecurityCommand::Security09),
            0x0D => Some(SecurityCommand::Security0D),
            0x0E => Some(SecurityCommand::Security0E),
            0x08 => Some(SecurityCommand::GetSessionInfo),
            0x11 => Some(SecurityCommand::ReadChallenge),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn description(&self) -> &'static str {
        match self {
            SecurityCommand::Security01 => "security 0x01 command",
            SecurityCommand::Security02 => "security 0x02 command",
            SecurityCommand::Security03 => "security 0x03 command",
            SecurityCommand::Security09 => "security 0x09 command",
            SecurityCommand::Security0D => "security 0x0D command",
            SecurityCommand::Security0E => "security 0x0E command",
            SecurityCommand::GetSessionInfo => "get session info",
            SecurityCommand::ReadChallenge => "read security challenge",
        }
    }

    /// Counted stream this command is answered with, if any
    pub fn expected_stream(&self) -> Option<(u8, Characteristic)> {
        match self {
            SecurityCommand::Security09 => {
                Some((PATCH_CERTIFICATE_SIZE, Characteristic::CertificateData))
            }
            SecurityCommand::Security0E => {
                Some((PATCH_EPHEMERAL_SIZE, Characteristic::CertificateData))
            }
            SecurityCommand::ReadChallenge => Some((CHALLENGE_SIZE, Characteristic::ChallengeData)),
            SecurityCommand::GetSessionInfo => {
                Some((SESSION_INFO_SIZE, Characteristic::ChallengeData))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SecurityCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Status byte notified on the security commands characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SecurityEvent {
    Unknown = 0x00,
    CertificateAccepted = 0x04,
    ChallengeLoadDone = 0x08,
    CertificateReady = 0x0A,
    EphemeralReady = 0x0F,
}

impl SecurityEvent {
    /// Unrecognized bytes map to `Unknown`
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x04 => SecurityEvent::CertificateAccepted,
            0x08 => SecurityEvent::ChallengeLoadDone,
            0x0A => SecurityEvent::CertificateReady,
            0x0F => SecurityEvent::EphemeralReady,
            _ => SecurityEvent::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SecurityEvent::Unknown => "unknown",
            SecurityEvent::CertificateAccepted => "certificate accepted",
            SecurityEvent::ChallengeLoadDone => "challenge load done",
            SecurityEvent::CertificateReady => "certificate ready",
            SecurityEvent::EphemeralReady => "ephemeral ready",
        }
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Command a size hint announces the answer to, and where the stream arrives
pub fn stream_for_size(size: u8) -> Option<(SecurityCommand, Characteristic)> {
    match size {
        CHALLENGE_SIZE => Some((SecurityCommand::ReadChallenge, Characteristic::ChallengeData)),
        SESSION_INFO_SIZE => Some((SecurityCommand::GetSessionInfo, Characteristic::ChallengeData)),
        PATCH_CERTIFICATE_SIZE => Some((SecurityCommand::Security09, Characteristic::CertificateData)),
        PATCH_EPHEMERAL_SIZE => Some((SecurityCommand::Security0E, Characteristic::CertificateData)),
        _ => None,
    }
}

const APPLICATION_CERTIFICATE_V0: [u8; APPLICATION_CERTIFICATE_SIZE] = [
    0x03, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
    0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x00, 0x01, 0x5F, 0x14, 0x9F, 0xE1,
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0xE2, 0x36,
    0x95, 0x4F, 0xFD, 0x06, 0xA2, 0x25, 0x22, 0x57, 0xFA, 0xA7, 0x17, 0x6A,
    0xD9, 0x0A, 0x69, 0x02, 0xE6, 0x1D, 0xDA, 0xFF, 0x40, 0xFB, 0x36, 0xB8,
    0xFB, 0x52, 0xAA, 0x09, 0x2C, 0x33, 0xA8, 0x02, 0x32, 0x63, 0x2E, 0x94,
    0xAF, 0xA8, 0x28, 0x86, 0xAE, 0x75, 0xCE, 0xF9, 0x22, 0xCD, 0x88, 0x85,
    0xCE, 0x8C, 0xDA, 0xB5, 0x3D, 0xAB, 0x2A, 0x4F, 0x23, 0x9B, 0xCB, 0x17,
    0xC2, 0x6C, 0xDE, 0x74, 0x9E, 0xA1, 0x6F, 0x75, 0x89, 0x76, 0x04, 0x98,
    0x9F, 0xDC, 0xB3, 0xF0, 0xC7, 0xBC, 0x1D, 0xA5, 0xE6, 0x54, 0x1D, 0xC3,
    0xCE, 0xC6, 0x3E, 0x72, 0x0C, 0xD9, 0xB3, 0x6A, 0x7B, 0x59, 0x3C, 0xFC,
    0xC5, 0x65, 0xD6, 0x7F, 0x1E, 0xE1, 0x84, 0x64, 0xB9, 0xB9, 0x7C, 0xCF,
    0x06, 0xBE, 0xD0, 0x40, 0xC7, 0xBB, 0xD5, 0xD2, 0x2F, 0x35, 0xDF, 0xDB,
    0x44, 0x58, 0xAC, 0x7C, 0x46, 0x15,
];

const APPLICATION_CERTIFICATE_V1: [u8; APPLICATION_CERTIFICATE_SIZE] = [
    0x03, 0x03, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
    0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x00, 0x01, 0x61, 0x89, 0x76, 0x55,
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x82, 0x42,
    0xBE, 0x33, 0xF1, 0xA3, 0x30, 0x88, 0x01, 0x12, 0xFA, 0x62, 0xCC, 0x48,
    0x42, 0xA4, 0x3D, 0x12, 0x04, 0x92, 0x2A, 0xD2, 0x01, 0xD8, 0x77, 0x5B,
    0xB2, 0x26, 0xF6, 0x11, 0xF7, 0x5B, 0x0E, 0xF3, 0xD5, 0xBC, 0x6C, 0xC4,
    0x31, 0x7C, 0xAA, 0x45, 0x75, 0x84, 0xAB, 0x00, 0x3F, 0x17, 0x12, 0x33,
    0x60, 0x89, 0xD3, 0xA4, 0xF2, 0x98, 0x38, 0xED, 0x0D, 0xC6, 0x66, 0xDE,
    0xAE, 0xA2, 0xD6, 0x5A, 0x00, 0xDF, 0xFF, 0x5D, 0x7B, 0xCA, 0xE2, 0x16,
    0x55, 0xE3, 0x02, 0xE3, 0x45, 0x8E, 0x77, 0x4D, 0xAA, 0xAA, 0xCA, 0x87,
    0xAF, 0x75, 0xF1, 0xB8, 0x78, 0x84, 0xB1, 0x8D, 0x4C, 0xE8, 0x75, 0xD0,
    0xD1, 0x08, 0xC9, 0x03, 0xA8, 0x34, 0x47, 0x1A, 0x4F, 0xF6, 0x74, 0xB2,
    0xD3, 0x0B, 0xCB, 0xA0, 0x62, 0x37, 0x30, 0x14, 0xB7, 0x78, 0x6E, 0x44,
    0x37, 0xB1, 0x77, 0xAE, 0xC3, 0xC8,
];

/// Fixed application certificate for a security version
pub fn application_certificate(
    security_version: u16,
) -> Option<&'static [u8; APPLICATION_CERTIFICATE_SIZE]> {
    match security_version {
        0 => Some(&APPLICATION_CERTIFICATE_V0),
        1 => Some(&APPLICATION_CERTIFICATE_V1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_raw_values() {
        assert_eq!(SecurityCommand::GetSessionInfo.as_u8(), 0x08);
        assert_eq!(SecurityCommand::ReadChallenge.as_u8(), 0x11);
        assert_eq!(SecurityCommand::from_u8(0x0E), Some(SecurityCommand::Security0E));
        assert_eq!(SecurityCommand::from_u8(0x04), None);
    }

    #[test]
    fn test_event_unknown_fallback() {
        assert_eq!(SecurityEvent::from_u8(0x0A), SecurityEvent::CertificateReady);
        assert_eq!(SecurityEvent::from_u8(0x55), SecurityEvent::Unknown);
    }

    #[test]
    fn test_stream_table_agrees_with_commands() {
        for size in [23u8, 65, 67, 140] {
            let (command, characteristic) = stream_for_size(size).unwrap();
            assert_eq!(command.expected_stream(), Some((size, characteristic)));
        }
        assert_eq!(stream_for_size(24), None);
        assert_eq!(SecurityCommand::Security0D.expected_stream(), None);
    }

    #[test]
    fn test_application_certificate() {
        let certificate = application_certificate(0).unwrap();
        assert_eq!(certificate.len(), 162);
        assert_eq!(&certificate[..4], &[0x03, 0x00, 0x01, 0x02]);
        assert_eq!(&certificate[158..], &[0xAC, 0x7C, 0x46, 0x15]);
    }

    #[test]
    fn test_application_certificate_v1() {
        let certificate = application_certificate(1).unwrap();
        assert_eq!(&certificate[..4], &[0x03, 0x03, 0x01, 0x02]);
        assert_eq!(&certificate[20..24], &[0x61, 0x89, 0x76, 0x55]);
        assert_eq!(&certificate[158..], &[0x77, 0xAE, 0xC3, 0xC8]);
        assert_ne!(certificate, application_certificate(0).unwrap());
        assert!(application_certificate(2).is_none());
    }
}
