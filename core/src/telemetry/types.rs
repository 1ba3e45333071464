//! Sensor enumerations shared by the telemetry records

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage reported by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum SensorState {
    Manufacturing = 0,
    /// Out of the package, not activated yet
    Storage = 1,
    InsertionDetection = 2,
    InsertionFailed = 3,
    /// Advertising over BLE after activation
    Paired = 4,
    Expired = 5,
    /// Shut down by the app or stopped advertising at end of life
    Terminated = 6,
    /// Detected for a sensor that fell off
    Error = 7,
    ErrorTerminated = 8,
}

impl SensorState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SensorState::Manufacturing),
            1 => Some(SensorState::Storage),
            2 => Some(SensorState::InsertionDetection),
            3 => Some(SensorState::InsertionFailed),
            4 => Some(SensorState::Paired),
            5 => Some(SensorState::Expired),
            6 => Some(SensorState::Terminated),
            7 => Some(SensorState::Error),
            8 => Some(SensorState::ErrorTerminated),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SensorState::Manufacturing => "Manufacturing",
            SensorState::Storage => "Not activated",
            SensorState::InsertionDetection => "Insertion detection",
            SensorState::InsertionFailed => "Insertion failed",
            SensorState::Paired => "Paired",
            SensorState::Expired => "Expired",
            SensorState::Terminated => "Terminated",
            SensorState::Error => "Error",
            SensorState::ErrorTerminated => "Terminated (error)",
        }
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Sensor state shared across sensor generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum LifecycleState {
    Unknown = 0,
    NotActivated = 1,
    WarmingUp = 2,
    Active = 3,
    Expired = 4,
    Shutdown = 5,
    Failure = 6,
}

impl LifecycleState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LifecycleState::Unknown),
            1 => Some(LifecycleState::NotActivated),
            2 => Some(LifecycleState::WarmingUp),
            3 => Some(LifecycleState::Active),
            4 => Some(LifecycleState::Expired),
            5 => Some(LifecycleState::Shutdown),
            6 => Some(LifecycleState::Failure),
            _ => None,
        }
    }

    /// Map a raw patch state byte; values above 2 shift down by one
    pub fn from_patch_state(raw: u8) -> Option<Self> {
        Self::from_u8(if raw <= 2 { raw } else { raw - 1 })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum LifeState {
    Missing = 1,
    Warmup = 2,
    Ready = 3,
    Expired = 4,
    Active = 5,
    Ended = 6,
    InsertionFailed = 7,
}

impl LifeState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(LifeState::Missing),
            2 => Some(LifeState::Warmup),
            3 => Some(LifeState::Ready),
            4 => Some(LifeState::Expired),
            5 => Some(LifeState::Active),
            6 => Some(LifeState::Ended),
            7 => Some(LifeState::InsertionFailed),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            LifeState::Missing => "missing",
            LifeState::Warmup => "warmup",
            LifeState::Ready => "ready",
            LifeState::Expired => "expired",
            LifeState::Active => "active",
            LifeState::Ended => "ended",
            LifeState::InsertionFailed => "insertion failed",
        }
    }
}

/// Reading condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum Condition {
    Ok = 0,
    Invalid = 1,
    /// Early signal attenuation
    Esa = 2,
}

impl Condition {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Condition::Ok),
            1 => Some(Condition::Invalid),
            2 => Some(Condition::Esa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum ProductType {
    Others = 1,
    Sensor = 4,
}

impl ProductType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProductType::Others),
            4 => Some(ProductType::Sensor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum ResultRange {
    In = 0,
    Below = 1,
    Above = 2,
}

impl ResultRange {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ResultRange::In),
            1 => Some(ResultRange::Below),
            2 => Some(ResultRange::Above),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResultRange::In => "in range",
            ResultRange::Below => "below range",
            ResultRange::Above => "above range",
        }
    }
}

/// 3-bit trend carried in the glucose bitfield; 6 and 7 stay raw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrendArrow {
    Unknown,
    FallingQuickly,
    Falling,
    Stable,
    Rising,
    RisingQuickly,
    Raw(u8),
}

impl TrendArrow {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => TrendArrow::Unknown,
            1 => TrendArrow::FallingQuickly,
            2 => TrendArrow::Falling,
            3 => TrendArrow::Stable,
            4 => TrendArrow::Rising,
            5 => TrendArrow::RisingQuickly,
            other => TrendArrow::Raw(other),
        }
    }

    pub fn bits(&self) -> u8 {
        match self {
            TrendArrow::Unknown => 0,
            TrendArrow::FallingQuickly => 1,
            TrendArrow::Falling => 2,
            TrendArrow::Stable => 3,
            TrendArrow::Rising => 4,
            TrendArrow::RisingQuickly => 5,
            TrendArrow::Raw(bits) => *bits,
        }
    }
}

impl fmt::Display for TrendArrow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendArrow::Unknown => write!(f, "---"),
            TrendArrow::FallingQuickly => write!(f, "↓"),
            TrendArrow::Falling => write!(f, "↘"),
            TrendArrow::Stable => write!(f, "→"),
            TrendArrow::Rising => write!(f, "↗"),
            TrendArrow::RisingQuickly => write!(f, "↑"),
            TrendArrow::Raw(bits) => write!(f, "?{}", bits),
        }
    }
}

/// Market derived from the PatchInfo localization field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorRegion {
    Europe,
    UnitedStates,
    Unknown,
}

impl SensorRegion {
    pub fn from_localization(localization: u16) -> Self {
        match localization {
            1 => SensorRegion::Europe,
            2 => SensorRegion::UnitedStates,
            _ => SensorRegion::Unknown,
        }
    }
}

/// 32-bit receiver id derived from an account id string
pub fn receiver_id(account: &str) -> u32 {
    account
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(0x811C_9DC5) ^ b as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_state_values() {
        assert_eq!(SensorState::from_u8(1), Some(SensorState::Storage));
        assert_eq!(SensorState::from_u8(8), Some(SensorState::ErrorTerminated));
        assert_eq!(SensorState::from_u8(9), None);
        assert_eq!(SensorState::Storage.to_string(), "Not activated");
    }

    #[test]
    fn test_trend_arrow_bits() {
        assert_eq!(TrendArrow::from_bits(0x0B), TrendArrow::Stable);
        assert_eq!(TrendArrow::from_bits(0x06), TrendArrow::Raw(6));
        assert_eq!(TrendArrow::from_bits(0xFF), TrendArrow::Raw(7));
        for bits in 0..8u8 {
            assert_eq!(TrendArrow::from_bits(bits).bits(), bits);
        }
    }

    #[test]
    fn test_small_enums() {
        assert_eq!(LifeState::from_u8(5), Some(LifeState::Active));
        assert_eq!(LifeState::from_u8(0), None);
        assert_eq!(Condition::from_u8(2), Some(Condition::Esa));
        assert_eq!(ProductType::from_u8(4), Some(ProductType::Sensor));
        assert_eq!(ProductType::from_u8(2), None);
        assert_eq!(ResultRange::from_u8(1).unwrap().description(), "below range");
        assert_eq!(SensorRegion::from_localization(2), SensorRegion::UnitedStates);
        assert_eq!(SensorRegion::from_localization(9), SensorRegion::Unknown);
    }

    #[test]
    fn test_receiver_id() {
        assert_eq!(receiver_id(""), 0);
        assert_eq!(receiver_id("a"), 0x61);
        // ((0x61 * 0x811C9DC5) mod 2^32) ^ 0x62
        let expected = 0x61u32.wrapping_mul(0x811C_9DC5) ^ 0x62;
        assert_eq!(receiver_id("ab"), expected);
    }

    #[test]
    fn test_receiver_id_known_account() {
        assert_eq!(receiver_id("2977dec2-492a-11ea-9702-0242ac110002"), 524381581);
    }

    #[test]
    fn test_lifecycle_from_patch_state() {
        assert_eq!(
            LifecycleState::from_patch_state(SensorState::Storage as u8),
            Some(LifecycleState::NotActivated)
        );
        assert_eq!(
            LifecycleState::from_patch_state(SensorState::Paired as u8),
            Some(LifecycleState::Active)
        );
        assert_eq!(
            LifecycleState::from_patch_state(SensorState::Terminated as u8),
            Some(LifecycleState::Shutdown)
        );
        assert_eq!(LifecycleState::from_patch_state(SensorState::ErrorTerminated as u8), None);
        assert_eq!(LifecycleState::from_patch_state(0xFF), None);
    }

    #[test]
    fn test_receiver_id_matches_wide_fold() {
        let account = "6b7f2a34-1c0d-11ee-9f6a-0242ac120002";
        let wide = account.bytes().fold(0u64, |h, b| {
            ((h & 0xFFFF_FFFF) * 0x811C_9DC5) ^ b as u64
        });
        assert_eq!(receiver_id(account), wide as u32);
    }
}
