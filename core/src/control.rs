//! Control command channel on the patch control characteristic
//!
//! Command frame (13 bytes): `seal(body[7])` (11 bytes) ‖ enqueued id (LE u16)
//! Reply frame (10 bytes):   `seal(status[4])` (8 bytes) ‖ echoed enqueued id (LE u16)
//!
//! Enqueued ids start at 1 for every session. One command is outstanding at a time.

use crate::crypto::{CryptoError, CryptoProvider, CryptoSession, PacketType, TAG_SIZE};
use crate::transport::ble::SEQUENCE_ID_SIZE;
use crate::transport::Characteristic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub const CONTROL_COMMAND_SIZE: usize = 7;
pub const CONTROL_FRAME_SIZE: usize = CONTROL_COMMAND_SIZE + TAG_SIZE + SEQUENCE_ID_SIZE;
pub const CONTROL_STATUS_SIZE: usize = 4;

/// Data request sent to the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlCommand {
    /// Historical readings starting at a life count
    Historic { from_life_count: u16 },
    /// Clinical backfill starting at a life count
    Backfill { from_life_count: u16 },
    EventLog,
    FactoryData,
    ShutdownPatch,
}

impl ControlCommand {
    /// The 7-byte command body before sealing
    pub fn body(&self) -> [u8; CONTROL_COMMAND_SIZE] {
        match self {
            ControlCommand::Historic { from_life_count } => {
                let lc = from_life_count.to_le_bytes();
                [0x01, 0x00, 0x01, lc[0], lc[1], 0x00, 0x00]
            }
            ControlCommand::Backfill { from_life_count } => {
                let lc = from_life_count.to_le_bytes();
                [0x01, 0x01, 0x01, lc[0], lc[1], 0x00, 0x00]
            }
            ControlCommand::EventLog => [0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
            ControlCommand::FactoryData => [0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            ControlCommand::ShutdownPatch => [0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        }
    }

    /// Characteristic the requested data streams in on
    pub fn data_characteristic(&self) -> Option<Characteristic> {
        match self {
            ControlCommand::Historic { .. } => Some(Characteristic::HistoricalData),
            ControlCommand::Backfill { .. } => Some(Characteristic::ClinicalData),
            ControlCommand::EventLog => Some(Characteristic::EventLog),
            ControlCommand::FactoryData => Some(Characteristic::FactoryData),
            ControlCommand::ShutdownPatch => None,
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Historic { from_life_count } => {
                write!(f, "historic from {}", from_life_count)
            }
            ControlCommand::Backfill { from_life_count } => {
                write!(f, "backfill from {}", from_life_count)
            }
            ControlCommand::EventLog => write!(f, "event log"),
            ControlCommand::FactoryData => write!(f, "factory data"),
            ControlCommand::ShutdownPatch => write!(f, "shutdown patch"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Control command {0} still awaiting its reply")]
    Busy(ControlCommand),

    #[error("Enqueued ids exhausted")]
    IdsExhausted,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingControl {
    pub command: ControlCommand,
    pub enqueued_id: u16,
}

/// Result of matching a reply against the outstanding command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    Completed {
        command: ControlCommand,
        enqueued_id: u16,
        status: [u8; CONTROL_STATUS_SIZE],
    },
    Unattributed {
        enqueued_id: u16,
        reason: &'static str,
    },
}

#[derive(Debug)]
pub struct ControlChannel {
    next_id: u16,
    pending: Option<PendingControl>,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: None,
        }
    }

    pub fn pending(&self) -> Option<&PendingControl> {
        self.pending.as_ref()
    }

    /// Seal and frame `command`, recording it as outstanding
    pub fn frame<P: CryptoProvider + ?Sized>(
        &mut self,
        session: &mut CryptoSession,
        provider: &P,
        command: ControlCommand,
    ) -> Result<Vec<u8>, ControlError> {
        if let Some(pending) = &self.pending {
            return Err(ControlError::Busy(pending.command));
        }
        let enqueued_id = self.next_id;
        let next_id = enqueued_id.checked_add(1).ok_or(ControlError::IdsExhausted)?;

        let (_, sealed) = session.encrypt(provider, PacketType::ControlCommand, &command.body())?;
        let mut frame = sealed;
        frame.extend_from_slice(&enqueued_id.to_le_bytes());

        self.next_id = next_id;
        self.pending = Some(PendingControl {
            command,
            enqueued_id,
        });
        debug!(
            "Control command {} #{}: {}",
            command,
            enqueued_id,
            hex::encode(&frame)
        );
        Ok(frame)
    }

    /// Match and open a 10-byte reply
    pub fn on_reply<P: CryptoProvider + ?Sized>(
        &mut self,
        session: &mut CryptoSession,
        provider: &P,
        sealed_status: &[u8],
        enqueued_id: u16,
    ) -> Result<ReplyOutcome, ControlError> {
        let Some(pending) = self.pending else {
            warn!("Control reply #{} with no command outstanding", enqueued_id);
            return Ok(ReplyOutcome::Unattributed {
                enqueued_id,
                reason: "control reply with no command outstanding",
            });
        };
        if pending.enqueued_id != enqueued_id {
            warn!(
                "Control reply #{} does not match outstanding #{}",
                enqueued_id, pending.enqueued_id
            );
            return Ok(ReplyOutcome::Unattributed {
                enqueued_id,
                reason: "control reply id does not match the outstanding command",
            });
        }

        let plaintext = session.decrypt(
            provider,
            PacketType::ControlResponse,
            enqueued_id,
            sealed_status,
        )?;
        let mut status = [0u8; CONTROL_STATUS_SIZE];
        let n = plaintext.len().min(CONTROL_STATUS_SIZE);
        status[..n].copy_from_slice(&plaintext[..n]);

        self.pending = None;
        debug!(
            "Control command {} #{} completed: {}",
            pending.command,
            enqueued_id,
            hex::encode(status)
        );
        Ok(ReplyOutcome::Completed {
            command: pending.command,
            enqueued_id,
            status,
        })
    }

    /// Forget the outstanding command and restart ids at 1
    pub fn reset(&mut self) {
        self.next_id = 1;
        self.pending = None;
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CcmProvider, SessionKeys};

    fn sessions() -> (CryptoSession, CryptoSession) {
        let keys = SessionKeys::new([0x21; 16], [0x08; 8]);
        (
            CryptoSession::new(keys.clone(), 0x0100),
            CryptoSession::new(keys, 0x0200),
        )
    }

    #[test]
    fn test_command_bodies() {
        assert_eq!(
            ControlCommand::Historic {
                from_life_count: 0x2CEC
            }
            .body(),
            [0x01, 0x00, 0x01, 0xEC, 0x2C, 0x00, 0x00]
        );
        assert_eq!(
            ControlCommand::Backfill {
                from_life_count: 0x489B
            }
            .body(),
            [0x01, 0x01, 0x01, 0x9B, 0x48, 0x00, 0x00]
        );
        assert_eq!(ControlCommand::EventLog.body(), [0x04, 0x01, 0, 0, 0, 0, 0]);
        assert_eq!(ControlCommand::FactoryData.body(), [0x06, 0, 0, 0, 0, 0, 0]);
        assert_eq!(ControlCommand::ShutdownPatch.body(), [0x05, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_frame_layout_and_ids() {
        let provider = CcmProvider::new([0u8; 16]);
        let (mut ours, _) = sessions();
        let mut channel = ControlChannel::new();

        let frame = channel
            .frame(&mut ours, &provider, ControlCommand::EventLog)
            .unwrap();
        assert_eq!(frame.len(), CONTROL_FRAME_SIZE);
        assert_eq!(&frame[11..], &[0x01, 0x00]);
        assert_eq!(ours.out_sequence(), 0x0101);

        assert_eq!(
            channel.frame(&mut ours, &provider, ControlCommand::FactoryData),
            Err(ControlError::Busy(ControlCommand::EventLog))
        );
    }

    #[test]
    fn test_reply_resolves_pending() {
        let provider = CcmProvider::new([0u8; 16]);
        let (mut ours, _) = sessions();
        let mut channel = ControlChannel::new();
        channel
            .frame(&mut ours, &provider, ControlCommand::FactoryData)
            .unwrap();

        // the sensor seals its reply with the echoed id as sequence
        let keys = SessionKeys::new([0x21; 16], [0x08; 8]);
        let nonce = crate::crypto::build_nonce(1, PacketType::ControlResponse, keys.iv());
        let sealed = provider.seal(keys.key(), &nonce, &[0x00, 0x01, 0x02, 0x03]).unwrap();

        let outcome = channel.on_reply(&mut ours, &provider, &sealed, 1).unwrap();
        assert_eq!(
            outcome,
            ReplyOutcome::Completed {
                command: ControlCommand::FactoryData,
                enqueued_id: 1,
                status: [0x00, 0x01, 0x02, 0x03]
            }
        );
        assert!(channel.pending().is_none());

        let frame = channel
            .frame(&mut ours, &provider, ControlCommand::EventLog)
            .unwrap();
        assert_eq!(&frame[11..], &[0x02, 0x00]);
    }

    #[test]
    fn test_reply_with_other_id_is_unattributed() {
        let provider = CcmProvider::new([0u8; 16]);
        let (mut ours, _) = sessions();
        let mut channel = ControlChannel::new();

        assert!(matches!(
            channel.on_reply(&mut ours, &provider, &[0u8; 8], 1),
            Ok(ReplyOutcome::Unattributed { .. })
        ));

        channel
            .frame(&mut ours, &provider, ControlCommand::EventLog)
            .unwrap();
        assert!(matches!(
            channel.on_reply(&mut ours, &provider, &[0u8; 8], 7),
            Ok(ReplyOutcome::Unattributed { enqueued_id: 7, .. })
        ));
        assert!(channel.pending().is_some());
        assert!(!ours.is_invalidated());
    }

    #[test]
    fn test_reset_restarts_ids() {
        let provider = CcmProvider::new([0u8; 16]);
        let (mut ours, _) = sessions();
        let mut channel = ControlChannel::new();
        channel
            .frame(&mut ours, &provider, ControlCommand::EventLog)
            .unwrap();
        channel.reset();

        let frame = channel
            .frame(&mut ours, &provider, ControlCommand::EventLog)
            .unwrap();
        assert_eq!(&frame[11..], &[0x01, 0x00]);
    }
}
