//! Fixed binary telemetry records
//!
//! All multi-byte integers are little-endian. Bytes past a record's fixed part,
//! and reserved bits, are kept verbatim.

use super::types::{LifecycleState, ProductType, SensorRegion, SensorState, TrendArrow};
use super::{as_hex, DecodeError};
use serde::Serialize;

fn ensure(record: &'static str, need: usize, data: &[u8]) -> Result<(), DecodeError> {
    if data.len() < need {
        return Err(DecodeError::TooShort {
            record,
            need,
            got: data.len(),
        });
    }
    Ok(())
}

fn u16_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Sensor identity block read over NFC
///
/// Layout:
/// [2] securityVersion  [2] localization  [2] generation  [2] wearDuration (minutes)
/// [4] firmware  [1] productType  [1] warmupTime (x5 minutes)  [1] sensorState
/// [9] serial (ASCII)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchInfo {
    pub security_version: u16,
    pub localization: u16,
    pub generation: u16,
    pub wear_duration: u16,
    #[serde(serialize_with = "as_hex")]
    pub firmware: [u8; 4],
    pub product_type: u8,
    pub warmup_time: u8,
    pub sensor_state: u8,
    pub serial: String,
    #[serde(serialize_with = "as_hex")]
    pub trailing: Vec<u8>,
}

impl PatchInfo {
    pub const SIZE: usize = 24;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("PatchInfo", Self::SIZE, data)?;
        let serial = String::from_utf8_lossy(&data[15..24])
            .trim_end_matches('\0')
            .to_string();
        Ok(Self {
            security_version: u16_at(data, 0),
            localization: u16_at(data, 2),
            generation: u16_at(data, 4),
            wear_duration: u16_at(data, 6),
            firmware: [data[8], data[9], data[10], data[11]],
            product_type: data[12],
            warmup_time: data[13],
            sensor_state: data[14],
            serial,
            trailing: data[Self::SIZE..].to_vec(),
        })
    }

    /// Displayed most significant byte first
    pub fn firmware_version(&self) -> String {
        let f = self.firmware;
        format!("{}.{}.{}.{}", f[3], f[2], f[1], f[0])
    }

    pub fn product(&self) -> Option<ProductType> {
        ProductType::from_u8(self.product_type)
    }

    pub fn state(&self) -> Option<SensorState> {
        SensorState::from_u8(self.sensor_state)
    }

    /// Device-independent state for the raw sensor state byte
    pub fn lifecycle(&self) -> Option<LifecycleState> {
        LifecycleState::from_patch_state(self.sensor_state)
    }

    pub fn region(&self) -> SensorRegion {
        SensorRegion::from_localization(self.localization)
    }

    pub fn warmup_minutes(&self) -> u32 {
        self.warmup_time as u32 * 5
    }
}

/// Decrypted patch status notification
///
/// Layout:
/// [2] lifeCount  [2] errorData  [2] eventData  [1] index  [1] patchState
/// [2] currentLifeCount  [1] stackDisconnectReason  [1] appDisconnectReason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchStatus {
    pub life_count: u16,
    pub error_data: u16,
    pub event_data: u16,
    pub index: u8,
    pub patch_state: u8,
    pub current_life_count: u16,
    pub stack_disconnect_reason: u8,
    pub app_disconnect_reason: u8,
    #[serde(serialize_with = "as_hex")]
    pub trailing: Vec<u8>,
}

impl PatchStatus {
    pub const SIZE: usize = 12;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("PatchStatus", Self::SIZE, data)?;
        Ok(Self {
            life_count: u16_at(data, 0),
            error_data: u16_at(data, 2),
            event_data: u16_at(data, 4),
            index: data[6],
            patch_state: data[7],
            current_life_count: u16_at(data, 8),
            stack_disconnect_reason: data[10],
            app_disconnect_reason: data[11],
            trailing: data[Self::SIZE..].to_vec(),
        })
    }

    pub fn state(&self) -> Option<SensorState> {
        SensorState::from_u8(self.patch_state)
    }
}

/// One-minute reading
///
/// Layout:
/// [2] lifeCount  [2] readingMgDl  [2] rateOfChange (i16)  [2] esaDuration
/// [2] projectedGlucose  [2] historicalLifeCount  [2] historicalReading
/// [1] bitfield: trend (low 3 bits) | status (high 5 bits)
/// [2] uncappedCurrentMgDl  [2] uncappedHistoricMgDl  [2] temperature  [8] fastData
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseData {
    pub life_count: u16,
    pub reading_mg_dl: u16,
    pub rate_of_change: i16,
    pub esa_duration: u16,
    pub projected_glucose: u16,
    pub historical_life_count: u16,
    pub historical_reading: u16,
    pub trend: TrendArrow,
    /// High 5 bits of the bitfield, undocumented
    pub status_bits: u8,
    pub uncapped_current_mg_dl: u16,
    pub uncapped_historic_mg_dl: u16,
    pub temperature: u16,
    #[serde(serialize_with = "as_hex")]
    pub fast_data: [u8; 8],
    #[serde(serialize_with = "as_hex")]
    pub trailing: Vec<u8>,
}

impl GlucoseData {
    pub const SIZE: usize = 29;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("GlucoseData", Self::SIZE, data)?;
        let bitfield = data[14];
        let mut fast_data = [0u8; 8];
        fast_data.copy_from_slice(&data[21..29]);
        Ok(Self {
            life_count: u16_at(data, 0),
            reading_mg_dl: u16_at(data, 2),
            rate_of_change: u16_at(data, 4) as i16,
            esa_duration: u16_at(data, 6),
            projected_glucose: u16_at(data, 8),
            historical_life_count: u16_at(data, 10),
            historical_reading: u16_at(data, 12),
            trend: TrendArrow::from_bits(bitfield),
            status_bits: bitfield >> 3,
            uncapped_current_mg_dl: u16_at(data, 15),
            uncapped_historic_mg_dl: u16_at(data, 17),
            temperature: u16_at(data, 19),
            fast_data,
            trailing: data[Self::SIZE..].to_vec(),
        })
    }

    /// The packed bitfield byte as it appeared on the wire
    pub fn bitfield(&self) -> u8 {
        (self.status_bits << 3) | self.trend.bits()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogRecord {
    pub life_count: u16,
    pub error_data: u16,
    pub event_data: u16,
    pub index: u8,
}

/// Event log packet: whole records plus whatever did not fill one
///
/// Slots with index 255 carry no data and are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    pub records: Vec<EventLogRecord>,
    #[serde(serialize_with = "as_hex")]
    pub remainder: Vec<u8>,
}

impl EventLog {
    pub const RECORD_SIZE: usize = 7;
    pub const NO_DATA_INDEX: u8 = 255;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("EventLog", Self::RECORD_SIZE, data)?;
        let chunks = data.chunks_exact(Self::RECORD_SIZE);
        let remainder = chunks.remainder().to_vec();
        let records = chunks
            .filter(|r| r[6] != Self::NO_DATA_INDEX)
            .map(|r| EventLogRecord {
                life_count: u16_at(r, 0),
                error_data: u16_at(r, 2),
                event_data: u16_at(r, 4),
                index: r[6],
            })
            .collect();
        Ok(Self { records, remainder })
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Layout:
/// [2] lifeCount  [8] rawData  [2] readingMgDl  [2] historicMgDl
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FastData {
    pub life_count: u16,
    #[serde(serialize_with = "as_hex")]
    pub raw: [u8; 8],
    pub reading_mg_dl: u16,
    pub historic_mg_dl: u16,
    #[serde(serialize_with = "as_hex")]
    pub trailing: Vec<u8>,
}

impl FastData {
    pub const SIZE: usize = 14;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("FastData", Self::SIZE, data)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[2..10]);
        Ok(Self {
            life_count: u16_at(data, 0),
            raw,
            reading_mg_dl: u16_at(data, 10),
            historic_mg_dl: u16_at(data, 12),
            trailing: data[Self::SIZE..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalRecord {
    pub life_count: u16,
    pub reading: u16,
    pub dq_error: u16,
}

/// Historical or clinical backfill packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalData {
    pub records: Vec<HistoricalRecord>,
    #[serde(serialize_with = "as_hex")]
    pub remainder: Vec<u8>,
}

impl HistoricalData {
    pub const RECORD_SIZE: usize = 6;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("HistoricalData", Self::RECORD_SIZE, data)?;
        let chunks = data.chunks_exact(Self::RECORD_SIZE);
        let remainder = chunks.remainder().to_vec();
        let records = chunks
            .map(|r| HistoricalRecord {
                life_count: u16_at(r, 0),
                reading: u16_at(r, 2),
                dq_error: u16_at(r, 4),
            })
            .collect();
        Ok(Self { records, remainder })
    }
}

/// Answer to the NFC activation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationResponse {
    #[serde(serialize_with = "as_hex")]
    pub bd_address: [u8; 6],
    #[serde(serialize_with = "as_hex")]
    pub ble_pin: [u8; 4],
    pub activation_time: u32,
    #[serde(serialize_with = "as_hex")]
    pub trailing: Vec<u8>,
}

impl ActivationResponse {
    pub const SIZE: usize = 14;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        ensure("ActivationResponse", Self::SIZE, data)?;
        let mut bd_address = [0u8; 6];
        let mut ble_pin = [0u8; 4];
        bd_address.copy_from_slice(&data[0..6]);
        ble_pin.copy_from_slice(&data[6..10]);
        Ok(Self {
            bd_address,
            ble_pin,
            activation_time: u32_at(data, 10),
            trailing: data[Self::SIZE..].to_vec(),
        })
    }

    /// Colon-separated device address, most significant byte first
    pub fn device_address(&self) -> String {
        self.bd_address
            .iter()
            .rev()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}
