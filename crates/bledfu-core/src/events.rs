//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow an upload without
//! coupling to the session internals.

use std::fmt;

use crate::protocol::hex_string;
use crate::state::DfuState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Characteristic a packet travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Host -> control point
    Control,
    /// Host -> packet characteristic
    Data,
    /// Control point notification (Device -> Host)
    Notify,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => write!(f, "CTRL"),
            Channel::Data => write!(f, "DATA"),
            Channel::Notify => write!(f, "NOTIFY"),
        }
    }
}

/// Events emitted during an upload.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Protocol state changed.
    StateChanged { from: DfuState, to: DfuState },
    /// Image bytes acknowledged or written so far.
    Progress { bytes_sent: usize, total: usize },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Acknowledgment consumed by the sequence.
    AckReceived { payload: Vec<u8> },
    /// GATT write or notification.
    Packet {
        channel: Channel,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Upload failed.
    Error { message: String },
    /// Device activated the new image.
    Complete,
}

/// Observer trait for receiving upload events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "State changed");
            }
            DfuEvent::Progress { bytes_sent, total } => {
                let pct = if *total > 0 {
                    (*bytes_sent * 100) / *total
                } else {
                    100
                };
                tracing::info!(sent = bytes_sent, total = total, progress = %format!("{}%", pct), "Progress");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::AckReceived { payload } => {
                tracing::debug!(payload = %hex_string(payload), "ACK received");
            }
            DfuEvent::Packet {
                channel,
                length,
                data,
            } => {
                tracing::trace!(
                    channel = %channel,
                    len = length,
                    data = %data.as_deref().map(hex_string).unwrap_or_default(),
                    "GATT packet"
                );
            }
            DfuEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            DfuEvent::Complete => {
                tracing::info!("Firmware activated");
            }
        }
    }
}

/// Observer that keeps every event, for tests and post-mortems.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<DfuEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// States entered, in order.
    pub fn states(&self) -> Vec<DfuState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl DfuObserver for RecordingObserver {
    fn on_event(&self, event: &DfuEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
