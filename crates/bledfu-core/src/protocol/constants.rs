//! Protocol constants for the Nordic legacy BLE DFU service.
//!
//! Wire values must match the bootloader exactly.

use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// GATT Identifiers
// ============================================================================

/// DFU service UUID
pub const DFU_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123);

/// Control point characteristic (opcodes out, notifications in)
pub const DFU_CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);

/// Packet characteristic (size record and image data)
pub const DFU_PACKET_UUID: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);

// ============================================================================
// Control Values (Host -> Device)
// ============================================================================

pub const OP_START_DFU: [u8; 2] = [0x01, 0x04];
pub const OP_INITIALIZE_DFU: [u8; 1] = [0x02];
pub const OP_RECEIVE_FIRMWARE_IMAGE: [u8; 1] = [0x03];
pub const OP_VALIDATE_FIRMWARE_IMAGE: [u8; 1] = [0x04];
pub const OP_ACTIVATE_FIRMWARE_AND_RESET: [u8; 1] = [0x05];
pub const OP_SYSTEM_RESET: [u8; 1] = [0x06];

/// Written before RECEIVE_FIRMWARE_IMAGE. Meaning undocumented, required by
/// the bootloader.
pub const PRE_RECEIVE_MODE: [u8; 3] = [0x08, 0x0C, 0x00];

// ============================================================================
// Size Constants
// ============================================================================

/// Largest data packet that fits the default ATT MTU.
pub const MAX_PACKET_SIZE: usize = 20;

/// Packets sent between receipt notifications.
pub const PACKETS_PER_ACK: usize = 15;

/// Size record: 8 reserved bytes, u16 LE image size, 2 reserved bytes.
pub const SIZE_RECORD_LEN: usize = 12;
pub const SIZE_RECORD_OFFSET: usize = 8;

/// Largest image the 16-bit size field can describe.
pub const MAX_IMAGE_SIZE: usize = u16::MAX as usize;

// ============================================================================
// Timing
// ============================================================================

/// Minimum gap between two data packet writes.
pub const PACKET_INTERVAL: Duration = Duration::from_millis(10);

/// Default deadline for any acknowledgment wait.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for finding a DFU target.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(60);
