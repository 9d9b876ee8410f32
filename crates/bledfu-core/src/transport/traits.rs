//! GATT Transport layer abstraction.
//!
//! Defines the `GattTransport` trait for talking to the DFU service,
//! allowing different implementations (btleplug, mock, etc.).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    #[error("No DFU device found within {timeout_secs}s")]
    DeviceNotFound { timeout_secs: u64 },

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Control point write failed: {0}")]
    ControlWriteFailed(String),

    #[error("Packet write failed: {0}")]
    DataWriteFailed(String),

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("BLE error: {0}")]
    Ble(String),
}

/// Callback invoked with each control point notification payload.
///
/// Runs on whatever thread the backend delivers events on.
pub type NotificationCallback = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Abstract GATT transport for one connected DFU target.
///
/// This trait enables:
/// - Production implementation using btleplug
/// - Mock implementation for unit testing
pub trait GattTransport: Send + Sync {
    /// Write to the control point characteristic.
    fn write_control(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Write to the packet characteristic.
    fn write_data(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Enable control point notifications and route them to `callback`.
    fn subscribe_control_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError>;

    /// Drop the link.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;
}
