//! Control point opcodes.

use std::fmt;

use super::constants::*;

/// Opcode written to the DFU control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuOpcode {
    StartDfu,
    InitializeDfu,
    ReceiveFirmwareImage,
    ValidateFirmwareImage,
    ActivateFirmwareAndReset,
    SystemReset,
}

impl DfuOpcode {
    /// Wire encoding of the opcode.
    pub const fn as_bytes(&self) -> &'static [u8] {
        match self {
            DfuOpcode::StartDfu => &OP_START_DFU,
            DfuOpcode::InitializeDfu => &OP_INITIALIZE_DFU,
            DfuOpcode::ReceiveFirmwareImage => &OP_RECEIVE_FIRMWARE_IMAGE,
            DfuOpcode::ValidateFirmwareImage => &OP_VALIDATE_FIRMWARE_IMAGE,
            DfuOpcode::ActivateFirmwareAndReset => &OP_ACTIVATE_FIRMWARE_AND_RESET,
            DfuOpcode::SystemReset => &OP_SYSTEM_RESET,
        }
    }

    /// Match a control point write back to its opcode.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        [
            DfuOpcode::StartDfu,
            DfuOpcode::InitializeDfu,
            DfuOpcode::ReceiveFirmwareImage,
            DfuOpcode::ValidateFirmwareImage,
            DfuOpcode::ActivateFirmwareAndReset,
            DfuOpcode::SystemReset,
        ]
        .into_iter()
        .find(|op| op.as_bytes() == bytes)
    }
}

impl fmt::Display for DfuOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuOpcode::StartDfu => write!(f, "START_DFU"),
            DfuOpcode::InitializeDfu => write!(f, "INITIALIZE_DFU"),
            DfuOpcode::ReceiveFirmwareImage => write!(f, "RECEIVE_FIRMWARE_IMAGE"),
            DfuOpcode::ValidateFirmwareImage => write!(f, "VALIDATE_FIRMWARE_IMAGE"),
            DfuOpcode::ActivateFirmwareAndReset => write!(f, "ACTIVATE_FIRMWARE_AND_RESET"),
            DfuOpcode::SystemReset => write!(f, "SYSTEM_RESET"),
        }
    }
}

/// Render bytes as lowercase hex for logs.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_wire_values() {
        assert_eq!(DfuOpcode::StartDfu.as_bytes(), &[0x01, 0x04]);
        assert_eq!(DfuOpcode::InitializeDfu.as_bytes(), &[0x02]);
        assert_eq!(DfuOpcode::ReceiveFirmwareImage.as_bytes(), &[0x03]);
        assert_eq!(DfuOpcode::ValidateFirmwareImage.as_bytes(), &[0x04]);
        assert_eq!(DfuOpcode::ActivateFirmwareAndReset.as_bytes(), &[0x05]);
        assert_eq!(DfuOpcode::SystemReset.as_bytes(), &[0x06]);
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(
            DfuOpcode::from_bytes(&[0x04]),
            Some(DfuOpcode::ValidateFirmwareImage)
        );
        assert_eq!(DfuOpcode::from_bytes(&[0x01]), None);
        assert_eq!(DfuOpcode::from_bytes(&PRE_RECEIVE_MODE), None);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&PRE_RECEIVE_MODE), "080c00");
    }
}
