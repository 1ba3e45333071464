/// BLE (Bluetooth Low Energy) link layer for the sensor
///
/// This module provides the protocol-level pieces that sit directly on top of GATT:
///
/// - **gatt**: characteristic roles, link requests and the platform trait
/// - **reassembly**: putting notifications back together per characteristic
/// - **writer**: offset-prefixed fragmentation and the ordered write queue
///
/// The platform (CoreBluetooth, BlueZ, Android) owns scanning, connecting and discovery.
/// Everything here is testable without BLE hardware.

pub mod gatt;
pub mod reassembly;
pub mod writer;

// Re-export commonly used types
pub use gatt::{Characteristic, GattError, GattLink, GattWrite, LinkRequest, MAX_PACKET_SIZE};

pub use reassembly::{
    split_counted_stream, CompletePayload, ReassemblyBuffer, ReassemblyError, Reassembler,
    StreamClass, CONTROL_REPLY_SIZE, ONE_MINUTE_READING_SIZE, SEQUENCE_ID_SIZE,
    STREAM_CHUNK_PAYLOAD,
};

pub use writer::{
    defragment, fragment, OutboundWriter, WriterError, DEFAULT_MAX_CHUNK, DEFAULT_QUEUE_CAPACITY,
    OFFSET_PREFIX_SIZE,
};
