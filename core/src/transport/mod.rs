// Transport module: BLE link layer below the security handshake

pub mod ble;

pub use ble::{
    Characteristic, CompletePayload, GattError, GattLink, GattWrite, LinkRequest, OutboundWriter,
    ReassemblyError, Reassembler, WriterError,
};
