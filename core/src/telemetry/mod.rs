// Telemetry module: decoding reassembled (and decrypted) sensor payloads

pub mod records;
pub mod types;

pub use records::{
    ActivationResponse, EventLog, EventLogRecord, FastData, GlucoseData, HistoricalData,
    HistoricalRecord, PatchInfo, PatchStatus,
};
pub use types::{
    receiver_id, Condition, LifeState, LifecycleState, ProductType, ResultRange, SensorRegion,
    SensorState, TrendArrow,
};

use crate::crypto::PacketType;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{record} needs {need} bytes, got {got}")]
    TooShort {
        record: &'static str,
        need: usize,
        got: usize,
    },

    #[error("Unknown record kind: {0}")]
    UnknownRecord(String),
}

pub(crate) fn as_hex<T: AsRef<[u8]>, S: Serializer>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes.as_ref()))
}

/// Any decoded record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "record", content = "data", rename_all = "camelCase")]
pub enum TelemetryRecord {
    PatchInfo(PatchInfo),
    PatchStatus(PatchStatus),
    Glucose(GlucoseData),
    EventLog(EventLog),
    FastData(FastData),
    Historical(HistoricalData),
    Clinical(HistoricalData),
    Activation(ActivationResponse),
    /// Factory calibration chunk, layout undocumented
    FactoryData(#[serde(serialize_with = "as_hex")] Vec<u8>),
}

/// Record layouts selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    PatchInfo,
    PatchStatus,
    Glucose,
    EventLog,
    FastData,
    Historical,
    Clinical,
    Activation,
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        RecordKind::PatchInfo,
        RecordKind::PatchStatus,
        RecordKind::Glucose,
        RecordKind::EventLog,
        RecordKind::FastData,
        RecordKind::Historical,
        RecordKind::Clinical,
        RecordKind::Activation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RecordKind::PatchInfo => "patch-info",
            RecordKind::PatchStatus => "patch-status",
            RecordKind::Glucose => "glucose",
            RecordKind::EventLog => "event-log",
            RecordKind::FastData => "fast-data",
            RecordKind::Historical => "historical",
            RecordKind::Clinical => "clinical",
            RecordKind::Activation => "activation",
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<TelemetryRecord, DecodeError> {
        Ok(match self {
            RecordKind::PatchInfo => TelemetryRecord::PatchInfo(PatchInfo::decode(data)?),
            RecordKind::PatchStatus => TelemetryRecord::PatchStatus(PatchStatus::decode(data)?),
            RecordKind::Glucose => TelemetryRecord::Glucose(GlucoseData::decode(data)?),
            RecordKind::EventLog => TelemetryRecord::EventLog(EventLog::decode(data)?),
            RecordKind::FastData => TelemetryRecord::FastData(FastData::decode(data)?),
            RecordKind::Historical => TelemetryRecord::Historical(HistoricalData::decode(data)?),
            RecordKind::Clinical => TelemetryRecord::Clinical(HistoricalData::decode(data)?),
            RecordKind::Activation => {
                TelemetryRecord::Activation(ActivationResponse::decode(data)?)
            }
        })
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecordKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| DecodeError::UnknownRecord(s.to_string()))
    }
}

/// Decode the plaintext of an inbound packet; control traffic carries no telemetry
pub fn decode_packet(
    packet_type: PacketType,
    plaintext: &[u8],
) -> Result<Option<TelemetryRecord>, DecodeError> {
    let record = match packet_type {
        PacketType::ControlCommand | PacketType::ControlResponse => return Ok(None),
        PacketType::PatchStatus => RecordKind::PatchStatus.decode(plaintext)?,
        PacketType::CurrentGlucose => RecordKind::Glucose.decode(plaintext)?,
        PacketType::BackfillHistoric => RecordKind::Historical.decode(plaintext)?,
        PacketType::BackfillClinical => RecordKind::Clinical.decode(plaintext)?,
        PacketType::EventLog => RecordKind::EventLog.decode(plaintext)?,
        PacketType::FactoryData => TelemetryRecord::FactoryData(plaintext.to_vec()),
    };
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_from_str() {
        assert_eq!("glucose".parse::<RecordKind>(), Ok(RecordKind::Glucose));
        assert_eq!("Patch-Info".parse::<RecordKind>(), Ok(RecordKind::PatchInfo));
        assert_eq!(
            "bogus".parse::<RecordKind>(),
            Err(DecodeError::UnknownRecord("bogus".to_string()))
        );
        for kind in RecordKind::ALL {
            assert_eq!(kind.to_string().parse::<RecordKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_decode_packet_routing() {
        assert_eq!(decode_packet(PacketType::ControlResponse, &[0; 4]), Ok(None));
        assert!(matches!(
            decode_packet(PacketType::BackfillClinical, &[0; 14]),
            Ok(Some(TelemetryRecord::Clinical(h))) if h.records.len() == 2
        ));
        assert!(matches!(
            decode_packet(PacketType::FactoryData, &[1, 2, 3]),
            Ok(Some(TelemetryRecord::FactoryData(raw))) if raw == vec![1, 2, 3]
        ));
        assert!(decode_packet(PacketType::CurrentGlucose, &[0; 10]).is_err());
    }

    #[test]
    fn test_tagged_json() {
        let record = RecordKind::FastData.decode(&[0u8; 16]).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["record"], "fastData");
        assert_eq!(json["data"]["raw"], "0000000000000000");
        assert_eq!(json["data"]["trailing"], "0000");
    }
}
