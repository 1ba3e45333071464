//! Property tests for the BLE framing layer
//!
//! Run with: cargo test --test test_reassembly_properties

use cgmlink_core::transport::ble::{
    defragment, fragment, split_counted_stream, CompletePayload, Reassembler, ReassemblyError,
    OFFSET_PREFIX_SIZE, ONE_MINUTE_READING_SIZE,
};
use cgmlink_core::Characteristic;
use proptest::prelude::*;

proptest! {
    /// A counted stream completes exactly on its last chunk
    #[test]
    fn prop_counted_stream_completes_once(payload in prop::collection::vec(any::<u8>(), 1..=255)) {
        let mut reassembler = Reassembler::new();
        reassembler.expect_stream(Characteristic::CertificateData, payload.len());

        let chunks = split_counted_stream(&payload);
        let (last, head) = chunks.split_last().unwrap();
        for chunk in head {
            let out = reassembler.accept(Characteristic::CertificateData, chunk).unwrap();
            prop_assert!(out.is_none());
        }

        let out = reassembler.accept(Characteristic::CertificateData, last).unwrap();
        prop_assert_eq!(
            out,
            Some(CompletePayload::Stream {
                characteristic: Characteristic::CertificateData,
                payload,
            })
        );
        prop_assert!(reassembler.is_idle());
    }

    /// Dropping a chunk from a counted stream is always an index mismatch
    #[test]
    fn prop_missing_chunk_is_desync(
        payload in prop::collection::vec(any::<u8>(), 40..=140),
        skip in 0usize..2,
    ) {
        let mut reassembler = Reassembler::new();
        reassembler.expect_stream(Characteristic::ChallengeData, payload.len());
        let chunks = split_counted_stream(&payload);

        let mut result = Ok(None);
        for (i, chunk) in chunks.iter().enumerate() {
            if i == skip {
                continue;
            }
            result = reassembler.accept(Characteristic::ChallengeData, chunk);
            if result.is_err() {
                break;
            }
        }
        let is_index_mismatch = matches!(result, Err(ReassemblyError::IndexMismatch { .. }));
        prop_assert!(is_index_mismatch);
        prop_assert_eq!(reassembler.buffered(Characteristic::ChallengeData), 0);
    }

    /// Wherever the sensor splits a one-minute reading, the same frame comes out
    #[test]
    fn prop_reading_split_point_is_irrelevant(
        frame in prop::collection::vec(any::<u8>(), ONE_MINUTE_READING_SIZE),
        split in 1usize..ONE_MINUTE_READING_SIZE,
    ) {
        let mut reassembler = Reassembler::new();
        let (first, second) = frame.split_at(split);

        prop_assert!(reassembler.accept(Characteristic::OneMinuteReading, first).unwrap().is_none());
        let out = reassembler.accept(Characteristic::OneMinuteReading, second).unwrap();

        let expected_sequence = u16::from_le_bytes([frame[33], frame[34]]);
        prop_assert_eq!(
            out,
            Some(CompletePayload::Sequenced {
                characteristic: Characteristic::OneMinuteReading,
                payload: frame[..33].to_vec(),
                sequence: expected_sequence,
            })
        );
    }

    /// Offset prefixes cover the payload contiguously and nothing is lost
    #[test]
    fn prop_fragments_cover_payload(
        payload in prop::collection::vec(any::<u8>(), 1..600),
        max_chunk in 1usize..=18,
    ) {
        let chunks = fragment(&payload, max_chunk).unwrap();

        let mut expected_offset = 0usize;
        for chunk in &chunks {
            prop_assert!(chunk.len() > OFFSET_PREFIX_SIZE);
            prop_assert!(chunk.len() <= OFFSET_PREFIX_SIZE + max_chunk);
            let offset = u16::from_le_bytes([chunk[0], chunk[1]]) as usize;
            prop_assert_eq!(offset, expected_offset);
            expected_offset += chunk.len() - OFFSET_PREFIX_SIZE;
        }
        prop_assert_eq!(expected_offset, payload.len());
        prop_assert_eq!(defragment(&chunks).unwrap(), payload);
    }
}
