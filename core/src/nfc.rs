//! NFC activation command
//!
//! Activation hands the sensor its start time and the receiver it is bound to.
//! The reply is decoded by [`ActivationResponse`](crate::telemetry::ActivationResponse).

use crate::telemetry::{receiver_id, PatchInfo, SensorState};
use serde::Serialize;

/// Moves a sensor out of storage, or rebinds an activated one to a new receiver
pub const CODE_ACTIVATE: u8 = 0xA8;

/// Reads back the BLE PIN of an activated sensor
pub const CODE_GET_PIN: u8 = 0xA0;

/// Activation time, receiver id and checksum
pub const ACTIVATION_PARAMETERS_SIZE: usize = 10;

#[rustfmt::skip]
const CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1189, 0x2312, 0x329B, 0x4624, 0x57AD, 0x6536, 0x74BF,
    0x8C48, 0x9DC1, 0xAF5A, 0xBED3, 0xCA6C, 0xDBE5, 0xE97E, 0xF8F7,
    0x1081, 0x0108, 0x3393, 0x221A, 0x56A5, 0x472C, 0x75B7, 0x643E,
    0x9CC9, 0x8D40, 0xBFDB, 0xAE52, 0xDAED, 0xCB64, 0xF9FF, 0xE876,
    0x2102, 0x308B, 0x0210, 0x1399, 0x6726, 0x76AF, 0x4434, 0x55BD,
    0xAD4A, 0xBCC3, 0x8E58, 0x9FD1, 0xEB6E, 0xFAE7, 0xC87C, 0xD9F5,
    0x3183, 0x200A, 0x1291, 0x0318, 0x77A7, 0x662E, 0x54B5, 0x453C,
    0xBDCB, 0xAC42, 0x9ED9, 0x8F50, 0xFBEF, 0xEA66, 0xD8FD, 0xC974,
    0x4204, 0x538D, 0x6116, 0x709F, 0x0420, 0x15A9, 0x2732, 0x36BB,
    0xCE4C, 0xDFC5, 0xED5E, 0xFCD7, 0x8868, 0x99E1, 0xAB7A, 0xBAF3,
    0x5285, 0x430C, 0x7197, 0x601E, 0x14A1, 0x0528, 0x37B3, 0x263A,
    0xDECD, 0xCF44, 0xFDDF, 0xEC56, 0x98E9, 0x8960, 0xBBFB, 0xAA72,
    0x6306, 0x728F, 0x4014, 0x519D, 0x2522, 0x34AB, 0x0630, 0x17B9,
    0xEF4E, 0xFEC7, 0xCC5C, 0xDDD5, 0xA96A, 0xB8E3, 0x8A78, 0x9BF1,
    0x7387, 0x620E, 0x5095, 0x411C, 0x35A3, 0x242A, 0x16B1, 0x0738,
    0xFFCF, 0xEE46, 0xDCDD, 0xCD54, 0xB9EB, 0xA862, 0x9AF9, 0x8B70,
    0x8408, 0x9581, 0xA71A, 0xB693, 0xC22C, 0xD3A5, 0xE13E, 0xF0B7,
    0x0840, 0x19C9, 0x2B52, 0x3ADB, 0x4E64, 0x5FED, 0x6D76, 0x7CFF,
    0x9489, 0x8500, 0xB79B, 0xA612, 0xD2AD, 0xC324, 0xF1BF, 0xE036,
    0x18C1, 0x0948, 0x3BD3, 0x2A5A, 0x5EE5, 0x4F6C, 0x7DF7, 0x6C7E,
    0xA50A, 0xB483, 0x8618, 0x9791, 0xE32E, 0xF2A7, 0xC03C, 0xD1B5,
    0x2942, 0x38CB, 0x0A50, 0x1BD9, 0x6F66, 0x7EEF, 0x4C74, 0x5DFD,
    0xB58B, 0xA402, 0x9699, 0x8710, 0xF3AF, 0xE226, 0xD0BD, 0xC134,
    0x39C3, 0x284A, 0x1AD1, 0x0B58, 0x7FE7, 0x6E6E, 0x5CF5, 0x4D7C,
    0xC60C, 0xD785, 0xE51E, 0xF497, 0x8028, 0x91A1, 0xA33A, 0xB2B3,
    0x4A44, 0x5BCD, 0x6956, 0x78DF, 0x0C60, 0x1DE9, 0x2F72, 0x3EFB,
    0xD68D, 0xC704, 0xF59F, 0xE416, 0x90A9, 0x8120, 0xB3BB, 0xA232,
    0x5AC5, 0x4B4C, 0x79D7, 0x685E, 0x1CE1, 0x0D68, 0x3FF3, 0x2E7A,
    0xE70E, 0xF687, 0xC41C, 0xD595, 0xA12A, 0xB0A3, 0x8238, 0x93B1,
    0x6B46, 0x7ACF, 0x4854, 0x59DD, 0x2D62, 0x3CEB, 0x0E70, 0x1FF9,
    0xF78F, 0xE606, 0xD49D, 0xC514, 0xB1AB, 0xA022, 0x92B9, 0x8330,
    0x7BC7, 0x6A4E, 0x58D5, 0x495C, 0x3DE3, 0x2C6A, 0x1EF1, 0x0F78,
];

/// CRC-16 over `data` with the 0x8408 table and a 0xFFFF seed, bit-reversed on output
pub fn crc16(data: &[u8]) -> u16 {
    let crc = data.iter().fold(0xFFFFu16, |crc, &byte| {
        (crc >> 8) ^ CRC16_TABLE[((crc ^ byte as u16) & 0xFF) as usize]
    });
    crc.reverse_bits()
}

/// Custom NFC command for sensor activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationCommand {
    pub code: u8,
    #[serde(serialize_with = "crate::telemetry::as_hex")]
    pub parameters: [u8; ACTIVATION_PARAMETERS_SIZE],
}

impl ActivationCommand {
    /// Build the command for a sensor reporting `sensor_state`
    ///
    /// `activation_time` is in Unix seconds; the sensor is handed the second before it.
    pub fn new(sensor_state: u8, activation_time: u32, receiver_id: u32) -> Self {
        let code = if sensor_state == SensorState::Storage as u8 {
            CODE_ACTIVATE
        } else {
            CODE_GET_PIN
        };

        let mut parameters = [0u8; ACTIVATION_PARAMETERS_SIZE];
        parameters[0..4].copy_from_slice(&activation_time.saturating_sub(1).to_le_bytes());
        parameters[4..8].copy_from_slice(&receiver_id.to_le_bytes());
        let crc = crc16(&parameters[..8]);
        parameters[8..10].copy_from_slice(&crc.to_le_bytes());

        Self { code, parameters }
    }

    pub fn for_patch(info: &PatchInfo, activation_time: u32, receiver_id: u32) -> Self {
        Self::new(info.sensor_state, activation_time, receiver_id)
    }

    /// Receiver id derived from an account id
    pub fn for_account(sensor_state: u8, activation_time: u32, account: &str) -> Self {
        Self::new(sensor_state, activation_time, receiver_id(account))
    }

    pub fn activation_time(&self) -> u32 {
        u32::from_le_bytes([
            self.parameters[0],
            self.parameters[1],
            self.parameters[2],
            self.parameters[3],
        ])
    }

    pub fn receiver_id(&self) -> u32 {
        u32::from_le_bytes([
            self.parameters[4],
            self.parameters[5],
            self.parameters[6],
            self.parameters[7],
        ])
    }

    /// Whether this command moves the sensor out of storage
    pub fn activates(&self) -> bool {
        self.code == CODE_ACTIVATE
    }

    /// Code followed by the parameters
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + ACTIVATION_PARAMETERS_SIZE);
        bytes.push(self.code);
        bytes.extend_from_slice(&self.parameters);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x89F6);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_activation_layout() {
        let command = ActivationCommand::new(1, 1_700_000_000, 524381581);

        assert_eq!(command.code, CODE_ACTIVATE);
        assert!(command.activates());
        assert_eq!(
            hex::encode(command.parameters),
            "fff053658d6d411f9c28"
        );
        assert_eq!(command.activation_time(), 1_699_999_999);
        assert_eq!(command.receiver_id(), 524381581);
        assert_eq!(crc16(&command.parameters[..8]), 0x289C);
        assert_eq!(command.to_bytes()[0], 0xA8);
        assert_eq!(command.to_bytes().len(), 11);
    }

    #[test]
    fn test_code_depends_on_sensor_state() {
        for state in [0u8, 2, 3, 4, 5, 6, 7, 8] {
            let command = ActivationCommand::new(state, 1_700_000_000, 1);
            assert_eq!(command.code, CODE_GET_PIN, "sensor state {}", state);
        }
        // Parameters do not depend on the code
        assert_eq!(
            ActivationCommand::new(4, 1_700_000_000, 1).parameters,
            ActivationCommand::new(1, 1_700_000_000, 1).parameters
        );
    }

    #[test]
    fn test_for_account_hashes_the_account() {
        let command =
            ActivationCommand::for_account(1, 1_700_000_000, "2977dec2-492a-11ea-9702-0242ac110002");
        assert_eq!(command, ActivationCommand::new(1, 1_700_000_000, 524381581));
    }

    #[test]
    fn test_for_patch_reads_sensor_state() {
        let mut data = vec![0u8; PatchInfo::SIZE];
        data[14] = SensorState::Paired as u8;
        let info = PatchInfo::decode(&data).unwrap();
        assert_eq!(ActivationCommand::for_patch(&info, 10, 20).code, CODE_GET_PIN);

        data[14] = SensorState::Storage as u8;
        let info = PatchInfo::decode(&data).unwrap();
        assert_eq!(ActivationCommand::for_patch(&info, 10, 20).code, CODE_ACTIVATE);
    }

    #[test]
    fn test_activation_time_zero_does_not_wrap() {
        assert_eq!(ActivationCommand::new(1, 0, 0).activation_time(), 0);
    }
}
