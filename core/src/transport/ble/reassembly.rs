/// Notification reassembly
///
/// The sensor never sends more than 20 bytes per notification. Depending on the
/// characteristic, a logical payload is either a counted stream (index-prefixed chunks
/// whose total size was announced on the security characteristic), a fixed-size reply,
/// the two-part one-minute reading, or a self-contained frame ending in a sequence id.

use super::gatt::Characteristic;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Payload bytes carried by one counted-stream chunk (20 minus the index byte)
pub const STREAM_CHUNK_PAYLOAD: usize = 19;

/// Patch control replies are always this long
pub const CONTROL_REPLY_SIZE: usize = 10;

/// The one-minute reading arrives as 15 + 20 bytes
pub const ONE_MINUTE_READING_SIZE: usize = 35;

/// Trailing little-endian sequence id on data frames
pub const SEQUENCE_ID_SIZE: usize = 2;

/// How a characteristic's notifications are put back together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamClass {
    /// Index-prefixed chunks up to an announced size
    Counted,
    /// Fixed 10-byte reply carrying an enqueued id
    ControlReply,
    /// Fixed 35-byte reading split over two notifications
    Periodic,
    /// One notification = payload + sequence id
    Sequenced,
    /// One or two byte security events
    SecurityEvents,
    /// Services that never notify
    Silent,
}

impl StreamClass {
    pub fn of(characteristic: Characteristic) -> Self {
        match characteristic {
            Characteristic::ChallengeData | Characteristic::CertificateData => StreamClass::Counted,
            Characteristic::PatchControl => StreamClass::ControlReply,
            Characteristic::OneMinuteReading => StreamClass::Periodic,
            Characteristic::PatchStatus
            | Characteristic::HistoricalData
            | Characteristic::ClinicalData
            | Characteristic::EventLog
            | Characteristic::FactoryData => StreamClass::Sequenced,
            Characteristic::SecurityCommands => StreamClass::SecurityEvents,
            Characteristic::Data
            | Characteristic::Security
            | Characteristic::Debug
            | Characteristic::BleLogin => StreamClass::Silent,
        }
    }
}

/// A logical payload put back together from one or more notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletePayload {
    /// Counted stream with index bytes stripped
    Stream {
        characteristic: Characteristic,
        payload: Vec<u8>,
    },
    /// Patch control reply: sealed status plus the echoed enqueued id
    ControlReply { body: Vec<u8>, enqueued_id: u16 },
    /// Data frame: payload plus its trailing sequence id
    Sequenced {
        characteristic: Characteristic,
        payload: Vec<u8>,
        sequence: u16,
    },
    /// Raw security event (event byte, optional size hint)
    SecurityNotification { data: Vec<u8> },
    /// Notification dropped without affecting any buffer
    Ignored {
        characteristic: Characteristic,
        reason: &'static str,
    },
}

/// Errors for reassembly; all of them mean the link is out of sync
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("{characteristic}: {got} bytes would overrun the declared {expected}-byte payload")]
    Overrun {
        characteristic: Characteristic,
        expected: usize,
        got: usize,
    },
    #[error("{0}: data arrived before the stream size was announced")]
    SizeUnknown(Characteristic),
    #[error("{characteristic}: chunk index {got}, expected {expected}")]
    IndexMismatch {
        characteristic: Characteristic,
        expected: u8,
        got: u8,
    },
}

impl ReassemblyError {
    pub fn characteristic(&self) -> Characteristic {
        match self {
            ReassemblyError::Overrun { characteristic, .. }
            | ReassemblyError::IndexMismatch { characteristic, .. } => *characteristic,
            ReassemblyError::SizeUnknown(characteristic) => *characteristic,
        }
    }
}

/// Accumulation state for one characteristic
#[derive(Debug, Default, Clone)]
pub struct ReassemblyBuffer {
    data: Vec<u8>,
    /// Announced payload size (0 = unknown)
    expected: usize,
    /// Index the next counted chunk must carry
    next_index: u8,
}

impl ReassemblyBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    fn clear(&mut self) {
        self.data.clear();
        self.expected = 0;
        self.next_index = 0;
    }

    fn take(&mut self) -> Vec<u8> {
        let data = std::mem::take(&mut self.data);
        self.clear();
        data
    }
}

/// Per-connection notification reassembler
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<Characteristic, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce the payload size of the next counted stream on `characteristic`
    pub fn expect_stream(&mut self, characteristic: Characteristic, size: usize) {
        let buffer = self.buffers.entry(characteristic).or_default();
        if !buffer.is_empty() {
            warn!(
                "{}: dropping {} stale bytes before a new {}-byte stream",
                characteristic,
                buffer.len(),
                size
            );
        }
        buffer.clear();
        buffer.expected = size;
        debug!("{}: expecting {} payload bytes", characteristic, size);
    }

    /// Announced size of the counted stream on `characteristic` (0 = none)
    pub fn expected_stream_size(&self, characteristic: Characteristic) -> usize {
        self.buffers
            .get(&characteristic)
            .map(|b| b.expected)
            .unwrap_or(0)
    }

    /// Bytes currently held for `characteristic`
    pub fn buffered(&self, characteristic: Characteristic) -> usize {
        self.buffers
            .get(&characteristic)
            .map(ReassemblyBuffer::len)
            .unwrap_or(0)
    }

    /// True when no characteristic holds partial data or an announced size
    pub fn is_idle(&self) -> bool {
        self.buffers
            .values()
            .all(|b| b.is_empty() && b.expected == 0)
    }

    /// Drop every buffer (disconnect)
    pub fn reset(&mut self) {
        self.buffers.clear();
    }

    pub fn reset_characteristic(&mut self, characteristic: Characteristic) {
        self.buffers.remove(&characteristic);
    }

    /// Feed one raw notification
    ///
    /// Returns `Ok(None)` while a payload is still being accumulated. On error the
    /// affected buffer has already been reset.
    pub fn accept(
        &mut self,
        characteristic: Characteristic,
        chunk: &[u8],
    ) -> Result<Option<CompletePayload>, ReassemblyError> {
        debug!(
            "{}: notified {} bytes: {}",
            characteristic,
            chunk.len(),
            hex::encode(chunk)
        );

        if chunk.is_empty() {
            return Ok(Some(Self::ignored(characteristic, "empty notification")));
        }

        match StreamClass::of(characteristic) {
            StreamClass::Counted => self.accept_counted(characteristic, chunk),
            StreamClass::ControlReply => Ok(Some(Self::accept_control_reply(chunk))),
            StreamClass::Periodic => self.accept_periodic(characteristic, chunk),
            StreamClass::Sequenced => Ok(Some(Self::accept_sequenced(characteristic, chunk))),
            StreamClass::SecurityEvents => Ok(Some(CompletePayload::SecurityNotification {
                data: chunk.to_vec(),
            })),
            StreamClass::Silent => Ok(Some(Self::ignored(
                characteristic,
                "characteristic does not notify",
            ))),
        }
    }

    fn accept_counted(
        &mut self,
        characteristic: Characteristic,
        chunk: &[u8],
    ) -> Result<Option<CompletePayload>, ReassemblyError> {
        let buffer = self.buffers.entry(characteristic).or_default();

        if buffer.expected == 0 {
            buffer.clear();
            return Err(ReassemblyError::SizeUnknown(characteristic));
        }

        let index = chunk[0];
        if index != buffer.next_index {
            let expected = buffer.next_index;
            buffer.clear();
            return Err(ReassemblyError::IndexMismatch {
                characteristic,
                expected,
                got: index,
            });
        }

        let body = &chunk[1..];
        let total = buffer.data.len() + body.len();
        if total > buffer.expected {
            let expected = buffer.expected;
            buffer.clear();
            return Err(ReassemblyError::Overrun {
                characteristic,
                expected,
                got: total,
            });
        }

        buffer.data.extend_from_slice(body);
        buffer.next_index = buffer.next_index.wrapping_add(1);

        if buffer.data.len() == buffer.expected {
            let payload = buffer.take();
            debug!(
                "{}: stream complete, {} payload bytes",
                characteristic,
                payload.len()
            );
            return Ok(Some(CompletePayload::Stream {
                characteristic,
                payload,
            }));
        }
        Ok(None)
    }

    fn accept_control_reply(chunk: &[u8]) -> CompletePayload {
        if chunk.len() != CONTROL_REPLY_SIZE {
            return Self::ignored(
                Characteristic::PatchControl,
                "control reply is not 10 bytes",
            );
        }
        let (body, id) = chunk.split_at(CONTROL_REPLY_SIZE - SEQUENCE_ID_SIZE);
        CompletePayload::ControlReply {
            body: body.to_vec(),
            enqueued_id: u16::from_le_bytes([id[0], id[1]]),
        }
    }

    fn accept_periodic(
        &mut self,
        characteristic: Characteristic,
        chunk: &[u8],
    ) -> Result<Option<CompletePayload>, ReassemblyError> {
        let buffer = self.buffers.entry(characteristic).or_default();

        let total = buffer.data.len() + chunk.len();
        if total > ONE_MINUTE_READING_SIZE {
            buffer.clear();
            return Err(ReassemblyError::Overrun {
                characteristic,
                expected: ONE_MINUTE_READING_SIZE,
                got: total,
            });
        }

        buffer.data.extend_from_slice(chunk);
        if buffer.data.len() < ONE_MINUTE_READING_SIZE {
            return Ok(None);
        }

        let mut payload = buffer.take();
        let id = payload.split_off(ONE_MINUTE_READING_SIZE - SEQUENCE_ID_SIZE);
        Ok(Some(CompletePayload::Sequenced {
            characteristic,
            payload,
            sequence: u16::from_le_bytes([id[0], id[1]]),
        }))
    }

    fn accept_sequenced(characteristic: Characteristic, chunk: &[u8]) -> CompletePayload {
        if chunk.len() <= SEQUENCE_ID_SIZE {
            return Self::ignored(characteristic, "frame too short for a sequence id");
        }
        let (payload, id) = chunk.split_at(chunk.len() - SEQUENCE_ID_SIZE);
        CompletePayload::Sequenced {
            characteristic,
            payload: payload.to_vec(),
            sequence: u16::from_le_bytes([id[0], id[1]]),
        }
    }

    fn ignored(characteristic: Characteristic, reason: &'static str) -> CompletePayload {
        warn!("{}: discarding notification: {}", characteristic, reason);
        CompletePayload::Ignored {
            characteristic,
            reason,
        }
    }
}

/// Split `payload` into index-prefixed counted-stream chunks (the sensor's framing)
pub fn split_counted_stream(payload: &[u8]) -> Vec<Vec<u8>> {
    payload
        .chunks(STREAM_CHUNK_PAYLOAD)
        .enumerate()
        .map(|(index, body)| {
            let mut chunk = Vec::with_capacity(body.len() + 1);
            chunk.push(index as u8);
            chunk.extend_from_slice(body);
            chunk
        })
        .collect()
}
