/// Outbound writes
///
/// Payloads longer than a packet are split into chunks prefixed with the running byte
/// offset (2 bytes, LE): `00 00 ..18 bytes..`, `12 00 ..18 bytes..`, `24 00 ...`.
/// Every request goes through [`OutboundWriter`], which hands them to the platform
/// strictly in order and holds the next one back until the current write is acknowledged.

use super::gatt::{Characteristic, GattError, GattWrite, LinkRequest};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

/// Payload bytes per outbound chunk
pub const DEFAULT_MAX_CHUNK: usize = 18;

/// Size of the running offset prefix
pub const OFFSET_PREFIX_SIZE: usize = 2;

/// Default request queue capacity before backpressure
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Errors for outbound writes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriterError {
    #[error("Refusing to fragment an empty payload")]
    EmptyPayload,
    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(usize),
    #[error("Payload of {0} bytes does not fit 16-bit offsets")]
    PayloadTooLarge(usize),
    #[error("Chunk too short: {0} bytes")]
    ChunkTooShort(usize),
    #[error("Chunk offset {got}, expected {expected}")]
    OffsetMismatch { expected: usize, got: usize },
    #[error("Write queue full (backpressure)")]
    QueueFull,
    #[error("Write completion with no write in flight")]
    NothingInFlight,
    #[error(transparent)]
    Gatt(#[from] GattError),
}

/// Split a payload into offset-prefixed chunks of at most `max_chunk` payload bytes
pub fn fragment(payload: &[u8], max_chunk: usize) -> Result<Vec<Vec<u8>>, WriterError> {
    if payload.is_empty() {
        return Err(WriterError::EmptyPayload);
    }
    if max_chunk == 0 {
        return Err(WriterError::InvalidChunkSize(max_chunk));
    }
    if payload.len() - 1 > u16::MAX as usize {
        return Err(WriterError::PayloadTooLarge(payload.len()));
    }

    let chunks = payload
        .chunks(max_chunk)
        .enumerate()
        .map(|(i, body)| {
            let offset = (i * max_chunk) as u16;
            let mut chunk = Vec::with_capacity(OFFSET_PREFIX_SIZE + body.len());
            chunk.extend_from_slice(&offset.to_le_bytes());
            chunk.extend_from_slice(body);
            chunk
        })
        .collect();

    Ok(chunks)
}

/// Reverse [`fragment`]; every chunk must continue exactly where the previous ended
pub fn defragment(chunks: &[Vec<u8>]) -> Result<Vec<u8>, WriterError> {
    let mut payload = Vec::new();
    for chunk in chunks {
        if chunk.len() <= OFFSET_PREFIX_SIZE {
            return Err(WriterError::ChunkTooShort(chunk.len()));
        }
        let offset = u16::from_le_bytes([chunk[0], chunk[1]]) as usize;
        if offset != payload.len() {
            return Err(WriterError::OffsetMismatch {
                expected: payload.len(),
                got: offset,
            });
        }
        payload.extend_from_slice(&chunk[OFFSET_PREFIX_SIZE..]);
    }
    Ok(payload)
}

/// Ordered request queue with at most one write in flight
#[derive(Debug)]
pub struct OutboundWriter {
    queue: VecDeque<LinkRequest>,
    in_flight: Option<GattWrite>,
    capacity: usize,
}

impl OutboundWriter {
    /// Create a new writer
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
            capacity,
        }
    }

    /// Create a writer with default capacity
    pub fn new_default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }

    /// Number of requests waiting (excluding the one in flight)
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Nothing queued and nothing awaiting acknowledgement
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_none()
    }

    pub fn in_flight(&self) -> Option<&GattWrite> {
        self.in_flight.as_ref()
    }

    /// Whether `count` more requests fit in the queue
    pub fn has_room(&self, count: usize) -> bool {
        self.queue.len() + count <= self.capacity
    }

    /// Queue a request
    pub fn enqueue(&mut self, request: LinkRequest) -> Result<(), WriterError> {
        if !self.has_room(1) {
            return Err(WriterError::QueueFull);
        }
        self.queue.push_back(request);
        Ok(())
    }

    /// Queue a single-packet write
    pub fn write(&mut self, characteristic: Characteristic, data: Vec<u8>) -> Result<(), WriterError> {
        let write = GattWrite::new(characteristic, data)?;
        self.enqueue(LinkRequest::Write(write))
    }

    /// Fragment `payload` and queue every chunk; all or nothing
    pub fn write_fragmented(
        &mut self,
        characteristic: Characteristic,
        payload: &[u8],
    ) -> Result<usize, WriterError> {
        let chunks = fragment(payload, DEFAULT_MAX_CHUNK)?;
        if !self.has_room(chunks.len()) {
            return Err(WriterError::QueueFull);
        }
        let writes = chunks
            .into_iter()
            .map(|chunk| GattWrite::new(characteristic, chunk))
            .collect::<Result<Vec<_>, _>>()?;

        let count = writes.len();
        debug!(
            "{}: queued {} bytes as {} chunks",
            characteristic,
            payload.len(),
            count
        );
        self.queue.extend(writes.into_iter().map(LinkRequest::Write));
        Ok(count)
    }

    /// Next request for the platform, or `None` while a write awaits acknowledgement
    pub fn poll_request(&mut self) -> Option<LinkRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.queue.pop_front()?;
        if let LinkRequest::Write(write) = &request {
            self.in_flight = Some(write.clone());
        }
        Some(request)
    }

    /// The platform acknowledged the write in flight
    pub fn complete_write(&mut self) -> Result<GattWrite, WriterError> {
        self.in_flight.take().ok_or(WriterError::NothingInFlight)
    }

    /// Put a request the platform failed to start back at the head of the queue
    pub fn requeue(&mut self, request: LinkRequest) {
        if let LinkRequest::Write(write) = &request {
            if self.in_flight.as_ref() == Some(write) {
                self.in_flight = None;
            }
        }
        self.queue.push_front(request);
    }

    /// Drop everything, including the write in flight
    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight = None;
    }
}

impl Default for OutboundWriter {
    fn default() -> Self {
        Self::new_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_offsets() {
        let payload: Vec<u8> = (0..40).collect();
        let chunks = fragment(&payload, DEFAULT_MAX_CHUNK).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..2], &[0x00, 0x00]);
        assert_eq!(&chunks[1][..2], &[0x12, 0x00]);
        assert_eq!(&chunks[2][..2], &[0x24, 0x00]);
        assert_eq!(chunks[0].len(), 20);
        assert_eq!(chunks[2].len(), 2 + 4);
    }

    #[test]
    fn test_fragment_defragment_boundary_lengths() {
        for len in [1usize, 17, 18, 19, 36] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            let chunks = fragment(&payload, DEFAULT_MAX_CHUNK).unwrap();

            assert_eq!(chunks.len(), (len + 17) / 18, "length {}", len);
            assert!(chunks.iter().all(|c| c.len() <= 20));
            assert_eq!(defragment(&chunks).unwrap(), payload, "length {}", len);
        }
    }

    #[test]
    fn test_fragment_certificate_size() {
        let chunks = fragment(&[0u8; 162], DEFAULT_MAX_CHUNK).unwrap();
        assert_eq!(chunks.len(), 9);
        assert_eq!(&chunks[8][..2], &[0x90, 0x00]);
    }

    #[test]
    fn test_fragment_rejects_bad_input() {
        assert_eq!(fragment(&[], 18), Err(WriterError::EmptyPayload));
        assert_eq!(fragment(&[1], 0), Err(WriterError::InvalidChunkSize(0)));
    }

    #[test]
    fn test_defragment_detects_reordering() {
        let payload = vec![0x11u8; 40];
        let mut chunks = fragment(&payload, DEFAULT_MAX_CHUNK).unwrap();
        chunks.swap(0, 1);
        assert_eq!(
            defragment(&chunks),
            Err(WriterError::OffsetMismatch {
                expected: 0,
                got: 18
            })
        );
    }

    #[test]
    fn test_defragment_detects_skipped_chunk() {
        let payload = vec![0x22u8; 40];
        let mut chunks = fragment(&payload, DEFAULT_MAX_CHUNK).unwrap();
        chunks.remove(1);
        assert!(matches!(
            defragment(&chunks),
            Err(WriterError::OffsetMismatch { .. })
        ));
    }

    #[test]
    fn test_writer_holds_back_until_ack() {
        let mut writer = OutboundWriter::new_default();
        writer.write(Characteristic::SecurityCommands, vec![0x01]).unwrap();
        writer.write(Characteristic::SecurityCommands, vec![0x02]).unwrap();

        let first = writer.poll_request().unwrap();
        assert_eq!(
            first,
            LinkRequest::Write(GattWrite::new(Characteristic::SecurityCommands, vec![0x01]).unwrap())
        );
        assert!(writer.poll_request().is_none());

        let acked = writer.complete_write().unwrap();
        assert_eq!(acked.data, vec![0x01]);

        let second = writer.poll_request().unwrap();
        assert!(matches!(second, LinkRequest::Write(w) if w.data == vec![0x02]));
        writer.complete_write().unwrap();
        assert!(writer.is_idle());
    }

    #[test]
    fn test_writer_non_write_requests_do_not_block() {
        let mut writer = OutboundWriter::new_default();
        writer
            .enqueue(LinkRequest::EnableNotifications(Characteristic::PatchStatus))
            .unwrap();
        writer
            .enqueue(LinkRequest::EnableNotifications(Characteristic::EventLog))
            .unwrap();

        assert!(writer.poll_request().is_some());
        assert!(writer.poll_request().is_some());
        assert!(writer.poll_request().is_none());
        assert!(writer.is_idle());
    }

    #[test]
    fn test_writer_completion_without_write() {
        let mut writer = OutboundWriter::new_default();
        assert_eq!(writer.complete_write(), Err(WriterError::NothingInFlight));
    }

    #[test]
    fn test_writer_backpressure_all_or_nothing() {
        let mut writer = OutboundWriter::new(4);
        writer.write(Characteristic::SecurityCommands, vec![0x01]).unwrap();

        let result = writer.write_fragmented(Characteristic::CertificateData, &[0u8; 65]);
        assert_eq!(result, Err(WriterError::QueueFull));
        assert_eq!(writer.len(), 1);

        assert_eq!(
            writer.write_fragmented(Characteristic::CertificateData, &[0u8; 40]),
            Ok(3)
        );
        assert_eq!(writer.len(), 4);
        assert_eq!(
            writer.write(Characteristic::SecurityCommands, vec![0x02]),
            Err(WriterError::QueueFull)
        );
        assert!(!writer.has_room(1));

        writer.poll_request();
        assert!(writer.has_room(1));
        assert!(!writer.has_room(2));
    }

    #[test]
    fn test_writer_requeue_failed_write() {
        let mut writer = OutboundWriter::new_default();
        writer.write(Characteristic::PatchControl, vec![0xAA]).unwrap();
        writer.write(Characteristic::PatchControl, vec![0xBB]).unwrap();

        let first = writer.poll_request().unwrap();
        writer.requeue(first.clone());
        assert!(writer.in_flight().is_none());
        assert_eq!(writer.poll_request(), Some(first));
    }

    #[test]
    fn test_writer_clear() {
        let mut writer = OutboundWriter::new_default();
        writer
            .write_fragmented(Characteristic::ChallengeData, &[0u8; 40])
            .unwrap();
        writer.poll_request();
        writer.clear();
        assert!(writer.is_idle());
        assert!(writer.in_flight().is_none());
    }
}
