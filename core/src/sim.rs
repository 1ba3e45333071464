//! In-memory sensor that speaks the peripheral side of the protocol
//!
//! Used to exercise a [`LinkSession`] end to end without hardware: it answers the
//! security commands, checks the challenge response, hands out session keys, and
//! seals telemetry the way the sensor does.

use crate::control::{ControlCommand, CONTROL_COMMAND_SIZE, CONTROL_FRAME_SIZE};
use crate::crypto::provider::{handshake_open, handshake_seal};
use crate::crypto::{
    build_nonce, CcmProvider, CryptoError, CryptoProvider, CryptoSession, PacketType,
    SessionInfo, SessionKeys, BLE_PIN_SIZE, CHALLENGE_INPUT_SIZE, CHALLENGE_RANDOM_SIZE,
    EPHEMERAL_KEY_SIZE, HANDSHAKE_NONCE_SIZE, KEY_SIZE, TAG_SIZE,
};
use crate::security::commands::{
    CHALLENGE_SIZE, PATCH_CERTIFICATE_SIZE, PATCH_EPHEMERAL_SIZE, SESSION_INFO_SIZE,
};
use crate::security::{SecurityCommand, SecurityEvent, APPLICATION_CERTIFICATE_SIZE};
use crate::session::{LinkEvent, LinkSession};
use crate::transport::ble::{defragment, split_counted_stream};
use crate::transport::{Characteristic, LinkRequest, WriterError};
use crate::LinkError;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;
use web_time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("Sensor rejected {0}")]
    Rejected(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Framing(#[from] WriterError),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// One notification sent by the sensor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Characteristic,
    pub data: Vec<u8>,
}

impl Notification {
    fn new(characteristic: Characteristic, data: Vec<u8>) -> Self {
        Self {
            characteristic,
            data,
        }
    }
}

pub struct SimulatedSensor {
    k_auth: [u8; KEY_SIZE],
    ble_pin: [u8; BLE_PIN_SIZE],
    provider: CcmProvider,
    keys: SessionKeys,
    r1: [u8; CHALLENGE_RANDOM_SIZE],
    nonce1: [u8; HANDSHAKE_NONCE_SIZE],
    session_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    patch_certificate: Vec<u8>,
    patch_ephemeral: [u8; EPHEMERAL_KEY_SIZE],
    /// Offset-prefixed chunks received per characteristic
    writes: HashMap<Characteristic, Vec<Vec<u8>>>,
    enabled: HashSet<Characteristic>,
    /// Mirror of the application's session, used to open control commands
    app_session: Option<CryptoSession>,
    app_sequence: u16,
    out_sequences: [u16; 8],
    life_count: u16,
}

impl SimulatedSensor {
    /// Sensor with key material derived from `seed`
    pub fn new(k_auth: [u8; KEY_SIZE], ble_pin: [u8; BLE_PIN_SIZE], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; 8];
        let mut r1 = [0u8; CHALLENGE_RANDOM_SIZE];
        let mut nonce1 = [0u8; HANDSHAKE_NONCE_SIZE];
        let mut session_nonce = [0u8; HANDSHAKE_NONCE_SIZE];
        let mut patch_certificate = vec![0u8; PATCH_CERTIFICATE_SIZE as usize];
        let mut patch_ephemeral = [0u8; EPHEMERAL_KEY_SIZE];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut iv);
        rng.fill_bytes(&mut r1);
        rng.fill_bytes(&mut nonce1);
        rng.fill_bytes(&mut session_nonce);
        rng.fill_bytes(&mut patch_certificate);
        rng.fill_bytes(&mut patch_ephemeral);
        patch_ephemeral[0] = 0x04;

        Self {
            k_auth,
            ble_pin,
            provider: CcmProvider::new(k_auth),
            keys: SessionKeys::new(key, iv),
            r1,
            nonce1,
            session_nonce,
            patch_certificate,
            patch_ephemeral,
            writes: HashMap::new(),
            enabled: HashSet::new(),
            app_session: None,
            app_sequence: 0,
            out_sequences: [0; 8],
            life_count: 11520,
        }
    }

    /// Outbound sequence seed the application will derive from the session info
    pub fn sequence_seed(&self) -> u16 {
        u16::from_le_bytes([self.session_nonce[0], self.session_nonce[1]])
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn is_enabled(&self, characteristic: Characteristic) -> bool {
        self.enabled.contains(&characteristic)
    }

    pub fn enable_notifications(&mut self, characteristic: Characteristic) {
        self.enabled.insert(characteristic);
    }

    /// Handle one acknowledged write and return the notifications it triggers
    pub fn on_write(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<Vec<Notification>, SimError> {
        debug!("sensor <- {}: {}", characteristic, hex::encode(data));
        match characteristic {
            Characteristic::SecurityCommands => {
                let command = data
                    .first()
                    .and_then(|b| SecurityCommand::from_u8(*b))
                    .ok_or(SimError::Rejected("security command"))?;
                self.on_security_command(command)
            }
            Characteristic::CertificateData | Characteristic::ChallengeData => {
                let chunks = self.writes.entry(characteristic).or_default();
                if data.len() >= 2 && data[0] == 0 && data[1] == 0 {
                    chunks.clear();
                }
                chunks.push(data.to_vec());
                Ok(Vec::new())
            }
            Characteristic::PatchControl => self.on_control_command(data),
            _ => Err(SimError::Rejected("write to a read-only characteristic")),
        }
    }

    fn on_security_command(
        &mut self,
        command: SecurityCommand,
    ) -> Result<Vec<Notification>, SimError> {
        let mut out = Vec::new();
        match command {
            SecurityCommand::Security01 | SecurityCommand::Security02 => {}
            SecurityCommand::Security03 => {
                let certificate = self.take_written(Characteristic::CertificateData)?;
                if certificate.len() != APPLICATION_CERTIFICATE_SIZE {
                    return Err(SimError::Rejected("application certificate"));
                }
                out.push(self.event(SecurityEvent::CertificateAccepted, None));
            }
            SecurityCommand::Security09 => {
                out.push(self.event(
                    SecurityEvent::CertificateReady,
                    Some(PATCH_CERTIFICATE_SIZE),
                ));
                out.extend(stream(Characteristic::CertificateData, &self.patch_certificate));
            }
            SecurityCommand::Security0D => {}
            SecurityCommand::Security0E => {
                let ephemeral = self.take_written(Characteristic::CertificateData)?;
                if ephemeral.len() != EPHEMERAL_KEY_SIZE {
                    return Err(SimError::Rejected("application ephemeral"));
                }
                out.push(self.event(
                    SecurityEvent::EphemeralReady,
                    Some(PATCH_EPHEMERAL_SIZE),
                ));
                out.extend(stream(Characteristic::CertificateData, &self.patch_ephemeral));
            }
            SecurityCommand::ReadChallenge => {
                let mut challenge = self.r1.to_vec();
                challenge.extend_from_slice(&self.nonce1);
                debug_assert_eq!(challenge.len(), CHALLENGE_SIZE as usize);
                out.push(self.event(SecurityEvent::ChallengeLoadDone, Some(CHALLENGE_SIZE)));
                out.extend(stream(Characteristic::ChallengeData, &challenge));
            }
            SecurityCommand::GetSessionInfo => {
                let response = self.take_written(Characteristic::ChallengeData)?;
                let input = handshake_open(&self.k_auth, &self.nonce1, &response)?;
                if input.len() != CHALLENGE_INPUT_SIZE
                    || input[..16] != self.r1
                    || input[32..] != self.ble_pin
                {
                    return Err(SimError::Rejected("challenge response"));
                }
                let mut r2 = [0u8; CHALLENGE_RANDOM_SIZE];
                r2.copy_from_slice(&input[16..32]);

                let info = SessionInfo {
                    r2,
                    r1: self.r1,
                    keys: self.keys.clone(),
                };
                let mut payload =
                    handshake_seal(&self.k_auth, &self.session_nonce, &info.to_plaintext())?;
                payload.extend_from_slice(&self.session_nonce);
                debug_assert_eq!(payload.len(), SESSION_INFO_SIZE as usize);

                self.app_sequence = self.sequence_seed();
                self.app_session = Some(CryptoSession::new(self.keys.clone(), self.app_sequence));
                out.push(self.event(SecurityEvent::ChallengeLoadDone, Some(SESSION_INFO_SIZE)));
                out.extend(stream(Characteristic::ChallengeData, &payload));
            }
        }
        Ok(out)
    }

    fn on_control_command(&mut self, frame: &[u8]) -> Result<Vec<Notification>, SimError> {
        if frame.len() != CONTROL_FRAME_SIZE {
            return Err(SimError::Rejected("control frame length"));
        }
        let session = self
            .app_session
            .as_mut()
            .ok_or(SimError::Rejected("control command before authentication"))?;
        let sealed = &frame[..CONTROL_COMMAND_SIZE + TAG_SIZE];
        let enqueued_id = u16::from_le_bytes([frame[11], frame[12]]);

        self.app_sequence = self
            .app_sequence
            .checked_add(1)
            .ok_or(CryptoError::SequenceExhausted)?;
        let body = session.decrypt(
            &self.provider,
            PacketType::ControlCommand,
            self.app_sequence,
            sealed,
        )?;

        let command = parse_control(&body).ok_or(SimError::Rejected("control command body"))?;
        debug!("sensor: control command {} #{}", command, enqueued_id);

        let mut out = Vec::new();
        match command {
            ControlCommand::Historic { from_life_count } => {
                let mut record = Vec::new();
                for (i, reading) in [(0u16, 120u16), (5, 125)] {
                    record.extend_from_slice(&(from_life_count + i).to_le_bytes());
                    record.extend_from_slice(&reading.to_le_bytes());
                    record.extend_from_slice(&0u16.to_le_bytes());
                }
                record.extend_from_slice(&[0, 0]);
                out.push(self.sealed_frame(Characteristic::HistoricalData, &record)?);
            }
            ControlCommand::Backfill { from_life_count } => {
                let mut record = Vec::new();
                record.extend_from_slice(&from_life_count.to_le_bytes());
                record.extend_from_slice(&110u16.to_le_bytes());
                record.extend_from_slice(&0u16.to_le_bytes());
                out.push(self.sealed_frame(Characteristic::ClinicalData, &record)?);
            }
            ControlCommand::EventLog => {
                let mut record = Vec::new();
                for index in 0..2u8 {
                    record.extend_from_slice(&self.life_count.to_le_bytes());
                    record.extend_from_slice(&0u16.to_le_bytes());
                    record.extend_from_slice(&(index as u16 + 1).to_le_bytes());
                    record.push(index);
                }
                out.push(self.sealed_frame(Characteristic::EventLog, &record)?);
            }
            ControlCommand::FactoryData => {
                out.push(self.sealed_frame(Characteristic::FactoryData, &[0xFA; 14])?);
            }
            ControlCommand::ShutdownPatch => {}
        }

        // reply: sealed status with the enqueued id as its sequence
        let nonce = build_nonce(enqueued_id, PacketType::ControlResponse, self.keys.iv());
        let mut reply = self.provider.seal(self.keys.key(), &nonce, &[0x00; 4])?;
        reply.extend_from_slice(&enqueued_id.to_le_bytes());
        out.push(Notification::new(Characteristic::PatchControl, reply));
        Ok(out)
    }

    /// A sealed one-minute reading, split 15 + 20 like the sensor sends it
    pub fn glucose_reading(&mut self, plaintext: &[u8; 29]) -> Result<Vec<Notification>, SimError> {
        let frame = self.sealed_frame(Characteristic::OneMinuteReading, plaintext)?;
        let (first, second) = frame.data.split_at(15);
        Ok(vec![
            Notification::new(Characteristic::OneMinuteReading, first.to_vec()),
            Notification::new(Characteristic::OneMinuteReading, second.to_vec()),
        ])
    }

    /// Seal `plaintext` as the next packet on `characteristic`, sequence id appended
    pub fn sealed_frame(
        &mut self,
        characteristic: Characteristic,
        plaintext: &[u8],
    ) -> Result<Notification, SimError> {
        let packet_type = PacketType::inbound_for(characteristic)
            .ok_or(SimError::Rejected("no packet type for characteristic"))?;
        let slot = &mut self.out_sequences[packet_type as usize];
        *slot = slot.checked_add(1).ok_or(CryptoError::SequenceExhausted)?;
        let sequence = *slot;

        let nonce = build_nonce(sequence, packet_type, self.keys.iv());
        let mut data = self.provider.seal(self.keys.key(), &nonce, plaintext)?;
        data.extend_from_slice(&sequence.to_le_bytes());
        Ok(Notification::new(characteristic, data))
    }

    /// Play the sensor against `session` until the session has nothing left to send
    ///
    /// Every write is acknowledged after the sensor has consumed it, then the
    /// notifications it triggered are delivered in order.
    pub fn exchange<P: CryptoProvider>(
        &mut self,
        session: &mut LinkSession<P>,
        now: Instant,
    ) -> Result<Vec<LinkEvent>, SimError> {
        let mut events = Vec::new();
        while let Some(request) = session.poll_request() {
            match request {
                LinkRequest::Write(write) => {
                    let notifications = self.on_write(write.characteristic, &write.data)?;
                    session.on_write_complete()?;
                    for n in notifications {
                        events.extend(session.on_notification(n.characteristic, &n.data, now)?);
                    }
                }
                LinkRequest::EnableNotifications(c) => self.enable_notifications(c),
                LinkRequest::Disconnect => {
                    session.on_disconnect();
                    break;
                }
            }
        }
        Ok(events)
    }

    fn take_written(&mut self, characteristic: Characteristic) -> Result<Vec<u8>, SimError> {
        let chunks = self.writes.remove(&characteristic).unwrap_or_default();
        Ok(defragment(&chunks)?)
    }

    fn event(&self, event: SecurityEvent, size: Option<u8>) -> Notification {
        let mut data = vec![event as u8];
        data.extend(size);
        Notification::new(Characteristic::SecurityCommands, data)
    }
}

fn stream(characteristic: Characteristic, payload: &[u8]) -> Vec<Notification> {
    split_counted_stream(payload)
        .into_iter()
        .map(|chunk| Notification::new(characteristic, chunk))
        .collect()
}

fn parse_control(body: &[u8]) -> Option<ControlCommand> {
    let life_count = u16::from_le_bytes([*body.get(3)?, *body.get(4)?]);
    match body.get(..3)? {
        [0x01, 0x00, 0x01] => Some(ControlCommand::Historic {
            from_life_count: life_count,
        }),
        [0x01, 0x01, 0x01] => Some(ControlCommand::Backfill {
            from_life_count: life_count,
        }),
        [0x04, 0x01, 0x00] => Some(ControlCommand::EventLog),
        [0x06, 0x00, 0x00] => Some(ControlCommand::FactoryData),
        [0x05, 0x00, 0x00] => Some(ControlCommand::ShutdownPatch),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_round_trips_bodies() {
        for command in [
            ControlCommand::Historic {
                from_life_count: 11520,
            },
            ControlCommand::Backfill {
                from_life_count: 18587,
            },
            ControlCommand::EventLog,
            ControlCommand::FactoryData,
            ControlCommand::ShutdownPatch,
        ] {
            assert_eq!(parse_control(&command.body()), Some(command));
        }
        assert_eq!(parse_control(&[0x09; 7]), None);
    }

    #[test]
    fn test_challenge_stream_framing() {
        let mut sensor = SimulatedSensor::new([0x5A; 16], [1, 2, 3, 4], 1);
        let out = sensor.on_write(Characteristic::SecurityCommands, &[0x11]).unwrap();

        assert_eq!(out[0].data, vec![0x08, 23]);
        assert_eq!(out[1].data.len(), 20);
        assert_eq!(out[2].data.len(), 5);
        assert_eq!(out[2].data[0], 1);
    }

    #[test]
    fn test_certificate_accepted_needs_certificate() {
        let mut sensor = SimulatedSensor::new([0x5A; 16], [1, 2, 3, 4], 1);
        assert!(matches!(
            sensor.on_write(Characteristic::SecurityCommands, &[0x03]),
            Err(SimError::Rejected(_))
        ));
    }

    #[test]
    fn test_sealed_frame_sequences_increase() {
        let mut sensor = SimulatedSensor::new([0x5A; 16], [1, 2, 3, 4], 1);
        let a = sensor.sealed_frame(Characteristic::PatchStatus, &[0u8; 12]).unwrap();
        let b = sensor.sealed_frame(Characteristic::PatchStatus, &[0u8; 12]).unwrap();
        assert_eq!(a.data.len(), 18);
        assert_eq!(&a.data[16..], &[1, 0]);
        assert_eq!(&b.data[16..], &[2, 0]);
    }
}
