//! Security handshake state machine
//!
//! Pairing walks the full certificate and ephemeral exchange; reconnection to an
//! already paired sensor starts at the challenge. The machine never touches the
//! link itself: every step returns [`HandshakeAction`]s for the session to carry out.
//!
//! ```text
//! Idle -> 01 -> 02 -> certificate -> 03 -> (certificate accepted) -> 09
//!      -> (140-byte patch certificate) -> 0D -> ephemeral -> 0E
//!      -> (65-byte patch ephemeral) -> readChallenge -> (23-byte challenge)
//!      -> 40-byte response -> getSessionInfo -> (67-byte session info) -> Authenticated
//! ```

use super::commands::{
    application_certificate, stream_for_size, SecurityCommand, SecurityEvent,
    APPLICATION_CERTIFICATE_SIZE, CHALLENGE_SIZE, PATCH_CERTIFICATE_SIZE, PATCH_EPHEMERAL_SIZE,
    SESSION_INFO_SIZE,
};
use crate::crypto::{
    CryptoError, CryptoProvider, CryptoSession, BLE_PIN_SIZE, CHALLENGE_INPUT_SIZE,
    CHALLENGE_RANDOM_SIZE, EPHEMERAL_KEY_SIZE, HANDSHAKE_NONCE_SIZE, SESSION_INFO_BLOCK_SIZE,
};
use crate::transport::Characteristic;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Notifications requested before the first security command
pub const SECURITY_NOTIFICATIONS: [Characteristic; 3] = [
    Characteristic::SecurityCommands,
    Characteristic::CertificateData,
    Characteristic::ChallengeData,
];

/// Notifications requested once authenticated, in order
pub const DATA_NOTIFICATIONS: [Characteristic; 7] = [
    Characteristic::PatchControl,
    Characteristic::EventLog,
    Characteristic::HistoricalData,
    Characteristic::ClinicalData,
    Characteristic::FactoryData,
    Characteristic::PatchStatus,
    Characteristic::OneMinuteReading,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    Security01Sent,
    Security02Sent,
    CertificateWritten,
    Security03Sent,
    AwaitingCertAccepted,
    Security09Sent,
    Security0DSent,
    EphemeralWritten,
    Security0ESent,
    ReadChallengeSent,
    ChallengeResponseWritten,
    GetSessionInfoSent,
    Authenticated,
}

/// Work the session performs on behalf of the handshake
#[derive(Debug)]
pub enum HandshakeAction {
    /// Write one security command byte
    Send(SecurityCommand),
    /// Fragment and write a payload
    Write {
        characteristic: Characteristic,
        payload: Vec<u8>,
    },
    EnableNotifications(Characteristic),
    /// Arm the counted buffer of `characteristic` for `size` payload bytes
    ExpectStream {
        characteristic: Characteristic,
        size: usize,
    },
    /// The session keys are in place
    Established(CryptoSession),
    /// Input that no pending command accounts for
    Discarded {
        characteristic: Characteristic,
        reason: &'static str,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Unknown stream size hint: {0}")]
    UnknownStreamSize(u8),

    #[error("Cannot {action} in state {state:?}")]
    InvalidState {
        action: &'static str,
        state: HandshakeState,
    },

    #[error("Handshake crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Unknown security version: {0}")]
    UnknownSecurityVersion(u16),
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct ChallengeSecrets {
    r1: [u8; CHALLENGE_RANDOM_SIZE],
    r2: [u8; CHALLENGE_RANDOM_SIZE],
}

pub struct Handshake {
    state: HandshakeState,
    /// Last security command written, awaiting its answer
    pending: Option<SecurityCommand>,
    last_event: SecurityEvent,
    certificate: &'static [u8; APPLICATION_CERTIFICATE_SIZE],
    ble_pin: [u8; BLE_PIN_SIZE],
    secrets: Option<ChallengeSecrets>,
    rng: Box<dyn RngCore + Send>,
}

impl Handshake {
    pub fn new(security_version: u16, ble_pin: [u8; BLE_PIN_SIZE]) -> Result<Self, HandshakeError> {
        let certificate = application_certificate(security_version)
            .ok_or(HandshakeError::UnknownSecurityVersion(security_version))?;
        Ok(Self {
            state: HandshakeState::Idle,
            pending: None,
            last_event: SecurityEvent::Unknown,
            certificate,
            ble_pin,
            secrets: None,
            rng: Box::new(OsRng),
        })
    }

    /// Replace the random source used for `r2`
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn pending_command(&self) -> Option<SecurityCommand> {
        self.pending
    }

    pub fn last_event(&self) -> SecurityEvent {
        self.last_event
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }

    /// Full pairing with a fresh sensor
    pub fn start_pairing(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.ensure_idle("start pairing")?;
        info!("Starting pairing handshake");

        let mut actions: Vec<HandshakeAction> = SECURITY_NOTIFICATIONS
            .iter()
            .map(|c| HandshakeAction::EnableNotifications(*c))
            .collect();

        self.send(SecurityCommand::Security01, &mut actions);
        self.transition(HandshakeState::Security01Sent);
        self.send(SecurityCommand::Security02, &mut actions);
        self.transition(HandshakeState::Security02Sent);

        actions.push(HandshakeAction::Write {
            characteristic: Characteristic::CertificateData,
            payload: self.certificate.to_vec(),
        });
        self.transition(HandshakeState::CertificateWritten);

        self.send(SecurityCommand::Security03, &mut actions);
        self.transition(HandshakeState::Security03Sent);
        self.transition(HandshakeState::AwaitingCertAccepted);
        Ok(actions)
    }

    /// Reconnect to a paired sensor, starting at the challenge
    pub fn start_reconnect(&mut self) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.ensure_idle("start reconnect")?;
        info!("Starting reconnect handshake");

        let mut actions: Vec<HandshakeAction> = SECURITY_NOTIFICATIONS
            .iter()
            .map(|c| HandshakeAction::EnableNotifications(*c))
            .collect();
        self.send(SecurityCommand::ReadChallenge, &mut actions);
        self.transition(HandshakeState::ReadChallengeSent);
        Ok(actions)
    }

    /// A 1 or 2 byte notification on the security commands characteristic
    pub fn on_security_notification(
        &mut self,
        data: &[u8],
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let mut actions = Vec::new();
        let Some(&raw_event) = data.first() else {
            discard(&mut actions, "empty security notification");
            return Ok(actions);
        };

        let event = SecurityEvent::from_u8(raw_event);
        self.last_event = event;
        if event == SecurityEvent::Unknown {
            debug!("Security event: unknown (0x{:02X})", raw_event);
        } else {
            debug!("Security event: {}", event);
        }

        if self.pending.is_none() {
            discard(&mut actions, "security event with no pending command");
            return Ok(actions);
        }

        if let Some(&size) = data.get(1) {
            let Some((command, characteristic)) = stream_for_size(size) else {
                warn!("Unknown stream size hint {}, aborting handshake", size);
                self.reset();
                return Err(HandshakeError::UnknownStreamSize(size));
            };
            if self.pending != Some(command) {
                discard(&mut actions, "size hint does not match the pending command");
                return Ok(actions);
            }
            debug!(
                "Expecting {} bytes on {} for {}",
                size, characteristic, command
            );
            actions.push(HandshakeAction::ExpectStream {
                characteristic,
                size: size as usize,
            });
            return Ok(actions);
        }

        if event == SecurityEvent::CertificateAccepted {
            if self.pending == Some(SecurityCommand::Security03)
                && self.state == HandshakeState::AwaitingCertAccepted
            {
                self.send(SecurityCommand::Security09, &mut actions);
                self.transition(HandshakeState::Security09Sent);
            } else {
                discard(&mut actions, "certificate accepted without a pending 0x03");
            }
        }

        Ok(actions)
    }

    /// A counted stream completed on `characteristic`
    pub fn on_stream<P: CryptoProvider + ?Sized>(
        &mut self,
        provider: &mut P,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let mut actions = Vec::new();
        let expected = self.pending.and_then(|command| command.expected_stream());
        if payload.len() > u8::MAX as usize
            || expected != Some((payload.len() as u8, characteristic))
        {
            actions.push(HandshakeAction::Discarded {
                characteristic,
                reason: "stream not expected by the pending command",
            });
            warn!(
                "{}: unattributed {}-byte stream (pending {:?})",
                characteristic,
                payload.len(),
                self.pending
            );
            return Ok(actions);
        }

        match self.pending {
            Some(SecurityCommand::Security09) => {
                debug_assert_eq!(payload.len(), PATCH_CERTIFICATE_SIZE as usize);
                debug!("Patch certificate: {}", hex::encode(payload));
                let ephemeral = provider.application_ephemeral(payload)?;

                self.send(SecurityCommand::Security0D, &mut actions);
                self.transition(HandshakeState::Security0DSent);
                actions.push(HandshakeAction::Write {
                    characteristic: Characteristic::CertificateData,
                    payload: ephemeral.to_vec(),
                });
                self.transition(HandshakeState::EphemeralWritten);
                self.send(SecurityCommand::Security0E, &mut actions);
                self.transition(HandshakeState::Security0ESent);
            }

            Some(SecurityCommand::Security0E) => {
                debug_assert_eq!(payload.len(), PATCH_EPHEMERAL_SIZE as usize);
                debug!("Patch ephemeral: {}", hex::encode(payload));
                let mut patch_ephemeral = [0u8; EPHEMERAL_KEY_SIZE];
                patch_ephemeral.copy_from_slice(payload);
                provider.accept_patch_ephemeral(&patch_ephemeral)?;

                self.send(SecurityCommand::ReadChallenge, &mut actions);
                self.transition(HandshakeState::ReadChallengeSent);
            }

            Some(SecurityCommand::ReadChallenge) => {
                debug_assert_eq!(payload.len(), CHALLENGE_SIZE as usize);
                let mut r1 = [0u8; CHALLENGE_RANDOM_SIZE];
                let mut nonce1 = [0u8; HANDSHAKE_NONCE_SIZE];
                r1.copy_from_slice(&payload[..CHALLENGE_RANDOM_SIZE]);
                nonce1.copy_from_slice(&payload[payload.len() - HANDSHAKE_NONCE_SIZE..]);

                let mut r2 = [0u8; CHALLENGE_RANDOM_SIZE];
                self.rng.fill_bytes(&mut r2);
                debug!("Security challenge nonce1: {}", hex::encode(nonce1));

                let mut input = [0u8; CHALLENGE_INPUT_SIZE];
                input[..16].copy_from_slice(&r1);
                input[16..32].copy_from_slice(&r2);
                input[32..].copy_from_slice(&self.ble_pin);
                let response = provider.challenge_response(&nonce1, &input);
                input.zeroize();
                let response = response?;

                self.secrets = Some(ChallengeSecrets { r1, r2 });
                r1.zeroize();
                r2.zeroize();

                actions.push(HandshakeAction::Write {
                    characteristic: Characteristic::ChallengeData,
                    payload: response.to_vec(),
                });
                self.transition(HandshakeState::ChallengeResponseWritten);
                self.send(SecurityCommand::GetSessionInfo, &mut actions);
                self.transition(HandshakeState::GetSessionInfoSent);
            }

            Some(SecurityCommand::GetSessionInfo) => {
                debug_assert_eq!(payload.len(), SESSION_INFO_SIZE as usize);
                let mut block = [0u8; SESSION_INFO_BLOCK_SIZE];
                let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
                block.copy_from_slice(&payload[..SESSION_INFO_BLOCK_SIZE]);
                nonce.copy_from_slice(&payload[SESSION_INFO_BLOCK_SIZE..]);

                let info = provider.open_session_info(&block, &nonce)?;
                let confirmed = match &self.secrets {
                    Some(secrets) => secrets.r1 == info.r1 && secrets.r2 == info.r2,
                    None => false,
                };
                self.secrets = None;
                if !confirmed {
                    return Err(CryptoError::ConfirmationMismatch.into());
                }

                let seed = u16::from_le_bytes([nonce[0], nonce[1]]);
                let session = CryptoSession::new(info.keys.clone(), seed);
                self.pending = None;
                self.transition(HandshakeState::Authenticated);
                info!("Authenticated, outbound crypto sequence seeded at {}", seed);

                actions.extend(
                    DATA_NOTIFICATIONS
                        .iter()
                        .map(|c| HandshakeAction::EnableNotifications(*c)),
                );
                actions.push(HandshakeAction::Established(session));
            }

            _ => {}
        }

        Ok(actions)
    }

    /// Back to `Idle`, dropping the pending command and challenge secrets
    pub fn reset(&mut self) {
        if self.state != HandshakeState::Idle {
            debug!("Handshake reset from {:?}", self.state);
        }
        self.state = HandshakeState::Idle;
        self.pending = None;
        self.last_event = SecurityEvent::Unknown;
        self.secrets = None;
    }

    fn ensure_idle(&self, action: &'static str) -> Result<(), HandshakeError> {
        if self.state != HandshakeState::Idle {
            return Err(HandshakeError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    fn send(&mut self, command: SecurityCommand, actions: &mut Vec<HandshakeAction>) {
        self.pending = Some(command);
        actions.push(HandshakeAction::Send(command));
    }

    fn transition(&mut self, to: HandshakeState) {
        debug!("Handshake: {:?} -> {:?}", self.state, to);
        self.state = to;
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("last_event", &self.last_event)
            .finish_non_exhaustive()
    }
}

fn discard(actions: &mut Vec<HandshakeAction>, reason: &'static str) {
    warn!("Discarding security notification: {}", reason);
    actions.push(HandshakeAction::Discarded {
        characteristic: Characteristic::SecurityCommands,
        reason,
    });
}
