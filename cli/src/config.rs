// Configuration management for the cgmlink CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/cgmlink/config.json
// - Linux: ~/.config/cgmlink/config.json
// - Windows: %APPDATA%\cgmlink\config.json

use anyhow::{Context, Result};
use cgmlink_core::crypto::{BLE_PIN_SIZE, EPHEMERAL_KEY_SIZE, KEY_SIZE};
use cgmlink_core::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallback log filter when RUST_LOG is unset
    pub log_level: String,

    /// PIN from the NFC activation, 4 bytes hex
    pub ble_pin_hex: String,

    /// Handshake authentication key, 16 bytes hex
    pub k_auth_hex: String,

    /// Application ephemeral public key for pairing, 65 bytes hex
    pub ephemeral_hex: Option<String>,

    pub security_version: u16,

    /// Seconds of silence tolerated after a command
    pub response_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            ble_pin_hex: "00000000".to_string(),
            k_auth_hex: "00000000000000000000000000000000".to_string(),
            ephemeral_hex: None,
            security_version: 0,
            response_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("cgmlink");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value (validated, not saved)
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "log_level" => {
                self.log_level = value.to_string();
            }
            "ble_pin_hex" => {
                decode_fixed::<BLE_PIN_SIZE>(value, "BLE PIN")?;
                self.ble_pin_hex = value.to_lowercase();
            }
            "k_auth_hex" => {
                decode_fixed::<KEY_SIZE>(value, "authentication key")?;
                self.k_auth_hex = value.to_lowercase();
            }
            "ephemeral_hex" => {
                self.ephemeral_hex = if value.is_empty() {
                    None
                } else {
                    decode_fixed::<EPHEMERAL_KEY_SIZE>(value, "ephemeral key")?;
                    Some(value.to_lowercase())
                };
            }
            "security_version" => {
                self.security_version = value.parse().context("Invalid security version")?;
            }
            "response_timeout_secs" => {
                self.response_timeout_secs = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "log_level" => Some(self.log_level.clone()),
            "ble_pin_hex" => Some(self.ble_pin_hex.clone()),
            "k_auth_hex" => Some(self.k_auth_hex.clone()),
            "ephemeral_hex" => self.ephemeral_hex.clone(),
            "security_version" => Some(self.security_version.to_string()),
            "response_timeout_secs" => Some(self.response_timeout_secs.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("log_level".to_string(), self.log_level.clone()),
            ("ble_pin_hex".to_string(), self.ble_pin_hex.clone()),
            ("k_auth_hex".to_string(), "(hidden)".to_string()),
            (
                "ephemeral_hex".to_string(),
                self.ephemeral_hex
                    .as_ref()
                    .map(|_| "(set)".to_string())
                    .unwrap_or_else(|| "(none)".to_string()),
            ),
            ("security_version".to_string(), self.security_version.to_string()),
            (
                "response_timeout_secs".to_string(),
                format!("{}s", self.response_timeout_secs),
            ),
        ]
    }

    pub fn k_auth(&self) -> Result<[u8; KEY_SIZE]> {
        decode_fixed(&self.k_auth_hex, "authentication key")
    }

    pub fn ephemeral(&self) -> Result<Option<[u8; EPHEMERAL_KEY_SIZE]>> {
        self.ephemeral_hex
            .as_deref()
            .map(|hex| decode_fixed(hex, "ephemeral key"))
            .transpose()
    }

    /// Engine settings derived from this file
    pub fn session_config(&self) -> Result<SessionConfig> {
        let config = SessionConfig {
            security_version: self.security_version,
            ble_pin: decode_fixed(&self.ble_pin_hex, "BLE PIN")?,
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            ..SessionConfig::default()
        };
        config.validate().context("Invalid session settings")?;
        Ok(config)
    }
}

fn decode_fixed<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(value.trim()).with_context(|| format!("Invalid hex for {}", what))?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("{} must be {} bytes, got {}", what, N, bytes.len()))
}
