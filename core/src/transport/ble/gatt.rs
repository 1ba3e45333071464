/// GATT surface of the sensor
///
/// This module names every characteristic role the sensor exposes, the requests the
/// engine hands to the platform BLE stack, and the trait that platform code implements
/// to execute them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum size of a single notification or write (protocol limitation)
pub const MAX_PACKET_SIZE: usize = 20;

const UUID_SUFFIX: &str = "-EF89-11E9-81B4-2A2AE2DBCCE4";

/// Characteristic (and service) roles of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Characteristic {
    /// Data service
    Data,
    /// Control commands out, 10-byte replies in
    PatchControl,
    /// Patch status frames
    PatchStatus,
    /// Current glucose, every minute
    OneMinuteReading,
    /// Historic backfill frames
    HistoricalData,
    /// Clinical backfill frames
    ClinicalData,
    /// Event log frames
    EventLog,
    /// Factory data frames
    FactoryData,
    /// Security service
    Security,
    /// Single-byte security commands out, security events in
    SecurityCommands,
    /// Challenge and session info exchange
    ChallengeData,
    /// Certificate and ephemeral key exchange
    CertificateData,
    /// Debug service
    Debug,
    /// BLE login service
    BleLogin,
}

impl Characteristic {
    pub const ALL: [Characteristic; 14] = [
        Characteristic::Data,
        Characteristic::PatchControl,
        Characteristic::PatchStatus,
        Characteristic::OneMinuteReading,
        Characteristic::HistoricalData,
        Characteristic::ClinicalData,
        Characteristic::EventLog,
        Characteristic::FactoryData,
        Characteristic::Security,
        Characteristic::SecurityCommands,
        Characteristic::ChallengeData,
        Characteristic::CertificateData,
        Characteristic::Debug,
        Characteristic::BleLogin,
    ];

    /// Short (16-bit) form identifying the role inside the vendor UUID base
    fn short_id(&self) -> u16 {
        match self {
            Characteristic::Data => 0x10CC,
            Characteristic::PatchControl => 0x1338,
            Characteristic::PatchStatus => 0x1482,
            Characteristic::OneMinuteReading => 0x177A,
            Characteristic::HistoricalData => 0x195A,
            Characteristic::ClinicalData => 0x1AB8,
            Characteristic::EventLog => 0x1BEE,
            Characteristic::FactoryData => 0x1D24,
            Characteristic::Security => 0x203A,
            Characteristic::SecurityCommands => 0x2198,
            Characteristic::ChallengeData => 0x22CE,
            Characteristic::CertificateData => 0x23FA,
            Characteristic::Debug => 0x2400,
            Characteristic::BleLogin => 0xF001,
        }
    }

    /// Full UUID string as advertised by the sensor
    pub fn uuid(&self) -> String {
        match self {
            Characteristic::BleLogin => format!("{:04X}", self.short_id()),
            _ => format!("0898{:04X}{}", self.short_id(), UUID_SUFFIX),
        }
    }

    /// Resolve a role from its UUID (case-insensitive)
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.uuid().eq_ignore_ascii_case(uuid.trim()))
    }

    /// Stable kebab-case name used in traces and on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Characteristic::Data => "data",
            Characteristic::PatchControl => "patch-control",
            Characteristic::PatchStatus => "patch-status",
            Characteristic::OneMinuteReading => "one-minute-reading",
            Characteristic::HistoricalData => "historical-data",
            Characteristic::ClinicalData => "clinical-data",
            Characteristic::EventLog => "event-log",
            Characteristic::FactoryData => "factory-data",
            Characteristic::Security => "security",
            Characteristic::SecurityCommands => "security-commands",
            Characteristic::ChallengeData => "challenge-data",
            Characteristic::CertificateData => "certificate-data",
            Characteristic::Debug => "debug",
            Characteristic::BleLogin => "ble-login",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Characteristic::Data => "data service",
            Characteristic::PatchControl => "patch control",
            Characteristic::PatchStatus => "patch status",
            Characteristic::OneMinuteReading => "one-minute reading",
            Characteristic::HistoricalData => "historical data",
            Characteristic::ClinicalData => "clinical data",
            Characteristic::EventLog => "event log",
            Characteristic::FactoryData => "factory data",
            Characteristic::Security => "security service",
            Characteristic::SecurityCommands => "security commands",
            Characteristic::ChallengeData => "challenge data",
            Characteristic::CertificateData => "certificate data",
            Characteristic::Debug => "debug service",
            Characteristic::BleLogin => "BLE login",
        }
    }

    /// Whether the sensor notifies on this role
    pub fn can_notify(&self) -> bool {
        matches!(
            self,
            Characteristic::PatchControl
                | Characteristic::PatchStatus
                | Characteristic::OneMinuteReading
                | Characteristic::HistoricalData
                | Characteristic::ClinicalData
                | Characteristic::EventLog
                | Characteristic::FactoryData
                | Characteristic::SecurityCommands
                | Characteristic::ChallengeData
                | Characteristic::CertificateData
        )
    }

    /// Whether the engine writes to this role
    pub fn can_write(&self) -> bool {
        matches!(
            self,
            Characteristic::PatchControl
                | Characteristic::SecurityCommands
                | Characteristic::ChallengeData
                | Characteristic::CertificateData
        )
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for Characteristic {
    type Err = GattError;

    /// Accepts either the kebab-case name or the UUID
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .or_else(|| Self::from_uuid(s))
            .ok_or_else(|| GattError::UnknownCharacteristic(s.to_string()))
    }
}

/// Errors for GATT operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Enabling notifications failed: {0}")]
    NotifyFailed(String),
    #[error("Write of {0} bytes exceeds the {MAX_PACKET_SIZE}-byte packet limit")]
    PacketTooLarge(usize),
    #[error("Characteristic {0} is not writable")]
    NotWritable(Characteristic),
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(String),
    #[error("Not connected")]
    NotConnected,
}

/// A single acknowledged write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattWrite {
    /// Characteristic to write to
    pub characteristic: Characteristic,
    /// Data to write
    pub data: Vec<u8>,
}

impl GattWrite {
    /// Create a new write request
    pub fn new(characteristic: Characteristic, data: Vec<u8>) -> Result<Self, GattError> {
        if !characteristic.can_write() {
            return Err(GattError::NotWritable(characteristic));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(GattError::PacketTooLarge(data.len()));
        }
        Ok(Self {
            characteristic,
            data,
        })
    }
}

/// Work the engine asks the platform BLE stack to perform, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkRequest {
    /// Write with response; the next request is held back until it is acknowledged
    Write(GattWrite),
    /// Subscribe to notifications
    EnableNotifications(Characteristic),
    /// Drop the connection (after a fatal protocol error or a timeout)
    Disconnect,
}

/// Platform side of the link (CoreBluetooth, BlueZ, Android GATT, ...)
///
/// Implementations must deliver notifications in order and exactly once, and must
/// report write completion back to the engine only once the peripheral acknowledged it.
pub trait GattLink {
    /// Start a write with response
    fn write_with_response(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
    ) -> Result<(), GattError>;

    /// Subscribe to notifications
    fn enable_notifications(&mut self, characteristic: Characteristic) -> Result<(), GattError>;

    /// Drop the connection
    fn disconnect(&mut self) -> Result<(), GattError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            Characteristic::PatchControl.uuid(),
            "08981338-EF89-11E9-81B4-2A2AE2DBCCE4"
        );
        assert_eq!(
            Characteristic::OneMinuteReading.uuid(),
            "0898177A-EF89-11E9-81B4-2A2AE2DBCCE4"
        );
        assert_eq!(Characteristic::BleLogin.uuid(), "F001");
    }

    #[test]
    fn test_characteristic_from_uuid_case_insensitive() {
        assert_eq!(
            Characteristic::from_uuid("089822ce-ef89-11e9-81b4-2a2ae2dbcce4"),
            Some(Characteristic::ChallengeData)
        );
        assert_eq!(Characteristic::from_uuid("f001"), Some(Characteristic::BleLogin));
        assert_eq!(Characteristic::from_uuid("0000"), None);
    }

    #[test]
    fn test_characteristic_uuids_unique() {
        for (i, a) in Characteristic::ALL.iter().enumerate() {
            for b in &Characteristic::ALL[i + 1..] {
                assert_ne!(a.uuid(), b.uuid());
            }
        }
    }

    #[test]
    fn test_characteristic_from_str() {
        assert_eq!(
            "security-commands".parse::<Characteristic>().unwrap(),
            Characteristic::SecurityCommands
        );
        assert_eq!(
            "08981BEE-EF89-11E9-81B4-2A2AE2DBCCE4"
                .parse::<Characteristic>()
                .unwrap(),
            Characteristic::EventLog
        );
        assert!("nope".parse::<Characteristic>().is_err());
    }

    #[test]
    fn test_gatt_write_limits() {
        assert!(GattWrite::new(Characteristic::ChallengeData, vec![0; 20]).is_ok());
        assert_eq!(
            GattWrite::new(Characteristic::ChallengeData, vec![0; 21]),
            Err(GattError::PacketTooLarge(21))
        );
        assert_eq!(
            GattWrite::new(Characteristic::PatchStatus, vec![0]),
            Err(GattError::NotWritable(Characteristic::PatchStatus))
        );
    }
}
