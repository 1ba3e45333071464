// Per-connection engine settings

use crate::crypto::BLE_PIN_SIZE;
use crate::security::application_certificate;
use crate::transport::ble::DEFAULT_QUEUE_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default time to wait for the sensor after a command
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown security version: {0}")]
    UnknownSecurityVersion(u16),
    #[error("Response timeout must be greater than zero")]
    ZeroTimeout,
    #[error("Write queue capacity must be greater than zero")]
    ZeroCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Selects the application certificate
    pub security_version: u16,

    /// PIN returned by the NFC activation command
    pub ble_pin: [u8; BLE_PIN_SIZE],

    /// Silence after a command longer than this tears the link down
    pub response_timeout: Duration,

    /// Outbound requests held before backpressure
    pub write_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            security_version: 0,
            ble_pin: [0; BLE_PIN_SIZE],
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            write_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn new(ble_pin: [u8; BLE_PIN_SIZE]) -> Self {
        Self {
            ble_pin,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if application_certificate(self.security_version).is_none() {
            return Err(ConfigError::UnknownSecurityVersion(self.security_version));
        }
        if self.response_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.write_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}
