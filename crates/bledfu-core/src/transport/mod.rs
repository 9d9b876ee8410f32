//! Transport layer module.

#[cfg(feature = "ble")]
pub mod ble;
pub mod mock;
pub mod traits;

#[cfg(feature = "ble")]
pub use ble::{BtleplugTransport, DiscoveredDevice, ScanOptions};
pub use mock::{MockTransport, WriteRecord, WriteTarget};
pub use traits::{GattTransport, NotificationCallback, TransportError};
