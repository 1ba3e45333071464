// Session AEAD: nonce construction and per-direction sequence counters
//
// Nonce (13 bytes):
// [2] sequence (LE u16)
// [3] packet type descriptor
// [8] session IV
//
// Outbound packets use our own counter, inbound packets carry theirs in the trailing
// two bytes of the frame. Neither may ever repeat within a session.

use super::{CryptoError, CryptoProvider};
use crate::transport::Characteristic;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const NONCE_SIZE: usize = 13;
pub const TAG_SIZE: usize = 4;
pub const KEY_SIZE: usize = 16;
pub const IV_SIZE: usize = 8;

/// Packet classification bound into every nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    ControlCommand = 0,
    ControlResponse = 1,
    PatchStatus = 2,
    CurrentGlucose = 3,
    BackfillHistoric = 4,
    BackfillClinical = 5,
    EventLog = 6,
    FactoryData = 7,
}

const PACKET_DESCRIPTORS: [[u8; 3]; 8] = [
    [0x00, 0x00, 0x00],
    [0x00, 0x00, 0x0F],
    [0x00, 0x00, 0xF0],
    [0x00, 0x0F, 0x00],
    [0x00, 0xF0, 0x00],
    [0x0F, 0x00, 0x00],
    [0xF0, 0x00, 0x00],
    [0x44, 0x00, 0x00],
];

impl PacketType {
    pub const ALL: [PacketType; 8] = [
        PacketType::ControlCommand,
        PacketType::ControlResponse,
        PacketType::PatchStatus,
        PacketType::CurrentGlucose,
        PacketType::BackfillHistoric,
        PacketType::BackfillClinical,
        PacketType::EventLog,
        PacketType::FactoryData,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Fixed 3-byte descriptor placed in the nonce
    pub fn descriptor(&self) -> [u8; 3] {
        PACKET_DESCRIPTORS[*self as usize]
    }

    /// Packet type of frames notified on `characteristic`
    pub fn inbound_for(characteristic: Characteristic) -> Option<Self> {
        match characteristic {
            Characteristic::PatchControl => Some(PacketType::ControlResponse),
            Characteristic::PatchStatus => Some(PacketType::PatchStatus),
            Characteristic::OneMinuteReading => Some(PacketType::CurrentGlucose),
            Characteristic::HistoricalData => Some(PacketType::BackfillHistoric),
            Characteristic::ClinicalData => Some(PacketType::BackfillClinical),
            Characteristic::EventLog => Some(PacketType::EventLog),
            Characteristic::FactoryData => Some(PacketType::FactoryData),
            _ => None,
        }
    }
}

/// Build the 13-byte nonce for one packet
pub fn build_nonce(sequence: u16, packet_type: PacketType, iv: &[u8; IV_SIZE]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0..2].copy_from_slice(&sequence.to_le_bytes());
    nonce[2..5].copy_from_slice(&packet_type.descriptor());
    nonce[5..13].copy_from_slice(iv);
    nonce
}

/// Session key material recovered from the session info
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl SessionKeys {
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys([REDACTED])")
    }
}

/// Live encrypted session
pub struct CryptoSession {
    keys: SessionKeys,
    /// Last outbound sequence used (the seed before the first packet)
    out_sequence: u16,
    /// Last accepted inbound sequence per packet type
    inbound: [Option<u16>; 8],
    invalidated: bool,
}

impl CryptoSession {
    /// Start a session; the first outbound packet uses `seed + 1`
    pub fn new(keys: SessionKeys, seed: u16) -> Self {
        Self {
            keys,
            out_sequence: seed,
            inbound: [None; 8],
            invalidated: false,
        }
    }

    /// Sequence of the most recent outbound packet (or the seed)
    pub fn out_sequence(&self) -> u16 {
        self.out_sequence
    }

    /// Last inbound sequence accepted for `packet_type`
    pub fn last_inbound(&self, packet_type: PacketType) -> Option<u16> {
        self.inbound[packet_type as usize]
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        self.keys.iv()
    }

    /// Seal an outbound payload; returns the sequence used and `ciphertext ‖ tag`
    pub fn encrypt<P: CryptoProvider + ?Sized>(
        &mut self,
        provider: &P,
        packet_type: PacketType,
        plaintext: &[u8],
    ) -> Result<(u16, Vec<u8>), CryptoError> {
        if self.invalidated {
            return Err(CryptoError::SessionInvalidated);
        }

        let sequence = match self.out_sequence.checked_add(1) {
            Some(sequence) => sequence,
            None => {
                self.invalidated = true;
                return Err(CryptoError::SequenceExhausted);
            }
        };

        let nonce = build_nonce(sequence, packet_type, self.keys.iv());
        let sealed = provider.seal(self.keys.key(), &nonce, plaintext).map_err(|e| {
            self.invalidated = true;
            e
        })?;
        self.out_sequence = sequence;

        debug!(
            "Sealed {:?} #{}: {} -> {} bytes",
            packet_type,
            sequence,
            plaintext.len(),
            sealed.len()
        );
        Ok((sequence, sealed))
    }

    /// Open an inbound `ciphertext ‖ tag` carrying `sequence`
    pub fn decrypt<P: CryptoProvider + ?Sized>(
        &mut self,
        provider: &P,
        packet_type: PacketType,
        sequence: u16,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if self.invalidated {
            return Err(CryptoError::SessionInvalidated);
        }
        if ciphertext.len() < TAG_SIZE {
            self.invalidated = true;
            return Err(CryptoError::InvalidLength {
                what: "sealed packet",
                expected: TAG_SIZE,
                got: ciphertext.len(),
            });
        }

        let slot = &mut self.inbound[packet_type as usize];
        if let Some(last) = *slot {
            if sequence <= last {
                self.invalidated = true;
                return Err(CryptoError::Replay {
                    packet_type,
                    sequence,
                    last,
                });
            }
            if sequence != last.wrapping_add(1) {
                warn!(
                    "{:?}: sequence gap, expected {} got {}",
                    packet_type,
                    last.wrapping_add(1),
                    sequence
                );
            }
        }

        let nonce = build_nonce(sequence, packet_type, self.keys.iv());
        match provider.open(self.keys.key(), &nonce, ciphertext) {
            Ok(plaintext) => {
                *slot = Some(sequence);
                Ok(plaintext)
            }
            Err(_) => {
                self.invalidated = true;
                Err(CryptoError::AuthenticationFailed(packet_type))
            }
        }
    }
}

impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("keys", &self.keys)
            .field("out_sequence", &self.out_sequence)
            .field("inbound", &self.inbound)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CcmProvider;

    const TEST_IV: [u8; 8] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7];

    fn test_keys() -> SessionKeys {
        SessionKeys::new([0x42; 16], TEST_IV)
    }

    #[test]
    fn test_packet_descriptors() {
        assert_eq!(PacketType::CurrentGlucose.descriptor(), [0x00, 0x0F, 0x00]);
        assert_eq!(PacketType::FactoryData.descriptor(), [0x44, 0x00, 0x00]);
        assert_eq!(PacketType::from_u8(6), Some(PacketType::EventLog));
        assert_eq!(PacketType::from_u8(8), None);
    }

    #[test]
    fn test_build_nonce_current_glucose() {
        let nonce = build_nonce(0x0001, PacketType::CurrentGlucose, &TEST_IV);
        assert_eq!(
            nonce,
            [0x01, 0x00, 0x00, 0x0F, 0x00, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7]
        );
    }

    #[test]
    fn test_sequence_strictly_increases() {
        let provider = CcmProvider::new([0x11; 16]);
        let mut ours = CryptoSession::new(test_keys(), 0);
        let mut peer = CryptoSession::new(test_keys(), 0);

        let mut previous = ours.out_sequence();
        for i in 0..1000u16 {
            let plaintext = i.to_le_bytes();
            let (sequence, sealed) = ours
                .encrypt(&provider, PacketType::ControlCommand, &plaintext)
                .unwrap();
            assert_eq!(sequence, previous + 1);
            assert_eq!(sealed.len(), plaintext.len() + TAG_SIZE);
            previous = sequence;

            let opened = peer
                .decrypt(&provider, PacketType::ControlCommand, sequence, &sealed)
                .unwrap();
            assert_eq!(opened, plaintext);
            assert_eq!(peer.last_inbound(PacketType::ControlCommand), Some(sequence));
        }
        assert_eq!(ours.out_sequence(), 1000);
    }

    #[test]
    fn test_replayed_sequence_invalidates() {
        let provider = CcmProvider::new([0x11; 16]);
        let mut ours = CryptoSession::new(test_keys(), 7);
        let mut peer = CryptoSession::new(test_keys(), 0);

        let (sequence, sealed) = ours
            .encrypt(&provider, PacketType::PatchStatus, b"status")
            .unwrap();
        assert_eq!(sequence, 8);
        peer.decrypt(&provider, PacketType::PatchStatus, sequence, &sealed)
            .unwrap();

        let err = peer
            .decrypt(&provider, PacketType::PatchStatus, sequence, &sealed)
            .unwrap_err();
        assert_eq!(
            err,
            CryptoError::Replay {
                packet_type: PacketType::PatchStatus,
                sequence: 8,
                last: 8
            }
        );
        assert!(peer.is_invalidated());
        assert_eq!(
            peer.decrypt(&provider, PacketType::EventLog, 1, &sealed),
            Err(CryptoError::SessionInvalidated)
        );
    }

    #[test]
    fn test_tampered_packet_fails() {
        let provider = CcmProvider::new([0x11; 16]);
        let mut ours = CryptoSession::new(test_keys(), 0);
        let mut peer = CryptoSession::new(test_keys(), 0);

        let (sequence, mut sealed) = ours
            .encrypt(&provider, PacketType::CurrentGlucose, &[0x55; 29])
            .unwrap();
        sealed[3] ^= 0x01;

        assert_eq!(
            peer.decrypt(&provider, PacketType::CurrentGlucose, sequence, &sealed),
            Err(CryptoError::AuthenticationFailed(PacketType::CurrentGlucose))
        );
        assert!(peer.is_invalidated());
    }

    #[test]
    fn test_packet_type_is_bound_into_nonce() {
        let provider = CcmProvider::new([0x11; 16]);
        let mut ours = CryptoSession::new(test_keys(), 0);
        let mut peer = CryptoSession::new(test_keys(), 0);

        let (sequence, sealed) = ours
            .encrypt(&provider, PacketType::EventLog, &[1, 2, 3])
            .unwrap();
        assert!(peer
            .decrypt(&provider, PacketType::FactoryData, sequence, &sealed)
            .is_err());
    }

    #[test]
    fn test_sequence_exhaustion() {
        let provider = CcmProvider::new([0x11; 16]);
        let mut ours = CryptoSession::new(test_keys(), u16::MAX - 1);

        let (sequence, _) = ours
            .encrypt(&provider, PacketType::ControlCommand, &[0])
            .unwrap();
        assert_eq!(sequence, u16::MAX);
        assert_eq!(
            ours.encrypt(&provider, PacketType::ControlCommand, &[0]),
            Err(CryptoError::SequenceExhausted)
        );
        assert!(ours.is_invalidated());
    }

    #[test]
    fn test_inbound_for_characteristics() {
        assert_eq!(
            PacketType::inbound_for(Characteristic::OneMinuteReading),
            Some(PacketType::CurrentGlucose)
        );
        assert_eq!(
            PacketType::inbound_for(Characteristic::ClinicalData),
            Some(PacketType::BackfillClinical)
        );
        assert_eq!(PacketType::inbound_for(Characteristic::ChallengeData), None);
    }

    #[test]
    fn test_session_keys_debug_redacted() {
        let rendered = format!("{:?}", CryptoSession::new(test_keys(), 0));
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("66")); // 0x42
    }
}
