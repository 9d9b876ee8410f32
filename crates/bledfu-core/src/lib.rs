//! bledfu-core: Nordic legacy BLE DFU uploader in Rust.
//!
//! This crate drives the legacy (unsecured) Device Firmware Update protocol
//! over a BLE GATT connection: control point opcodes, a size record, a
//! flow-controlled stream of 20-byte packets, validation and activation.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Opcodes, GATT UUIDs, the size record
//! - **Transport**: GATT abstraction (btleplug behind the `ble` feature, mock)
//! - **Flow**: Packet boundaries, receipt windows, pacing
//! - **Sync**: Notification callback to blocking wait
//! - **State**: Upload states and per-session counters
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//! - **Image**: Intel HEX / binary loading
//!
//! # Example
//!
//! ```no_run
//! use bledfu_core::{DfuSession, FirmwareImage, MockTransport, SessionConfig};
//!
//! let image = FirmwareImage::load("blinky.hex").expect("load");
//! let transport = MockTransport::new();
//! let mut session = DfuSession::new(&transport, &SessionConfig::default());
//! session.upload(image.as_bytes()).expect("DFU failed");
//! ```

pub mod error;
pub mod events;
pub mod flow;
pub mod image;
pub mod protocol;
pub mod session;
pub mod state;
pub mod sync;
pub mod transport;

// Re-exports for convenience
pub use error::UploadError;
pub use events::{DfuEvent, DfuObserver, LogLevel, NullObserver, TracingObserver};
pub use flow::{AckPlan, FlowController, Packet};
pub use image::{FirmwareImage, ImageError};
pub use protocol::{DfuOpcode, SizeRecord};
pub use session::{CancelHandle, DfuSession, SessionConfig, UploadReport, upload};
pub use state::DfuState;
pub use sync::{NotificationSynchronizer, SyncError};
#[cfg(feature = "ble")]
pub use transport::{BtleplugTransport, DiscoveredDevice, ScanOptions};
pub use transport::{GattTransport, MockTransport, TransportError};
