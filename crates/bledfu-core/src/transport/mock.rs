//! Mock GATT transport for testing.
//!
//! Emulates a legacy DFU bootloader: notifies after the size record, every
//! receipt window, at end of image and after validation, then resets on
//! activate. Faults can be injected per test.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::traits::{GattTransport, NotificationCallback, TransportError};
use crate::protocol::constants::{PACKETS_PER_ACK, PRE_RECEIVE_MODE};
use crate::protocol::{DfuOpcode, SizeRecord};

/// Characteristic a write went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Control,
    Data,
}

/// A captured write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub target: WriteTarget,
    pub bytes: Vec<u8>,
}

/// Write or notification, in the order the mock saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Write(WriteRecord),
    Notify(Vec<u8>),
}

/// Bootloader progress as seen by the emulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceStage {
    Idle,
    AwaitingSize,
    SizeReceived,
    Receiving,
    ImageReceived,
    Validated,
    Reset,
}

struct MockState {
    journal: Vec<MockEvent>,
    connected: bool,
    stage: DeviceStage,
    image_size: usize,
    bytes_received: usize,
    packets_since_ack: usize,
    notifications_sent: usize,
    disconnect_calls: usize,
    /// Fail the write with this index (0-based, both characteristics).
    fail_write_at: Option<usize>,
    /// Stop notifying once this many notifications went out.
    mute_after: Option<usize>,
    notify_delay: Option<Duration>,
    packets_per_ack: usize,
}

/// Mock transport for unit testing the upload sequence.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    callback: Arc<Mutex<Option<Arc<NotificationCallback>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                journal: Vec::new(),
                connected: true,
                stage: DeviceStage::Idle,
                image_size: 0,
                bytes_received: 0,
                packets_since_ack: 0,
                notifications_sent: 0,
                disconnect_calls: 0,
                fail_write_at: None,
                mute_after: None,
                notify_delay: None,
                packets_per_ack: PACKETS_PER_ACK,
            })),
            callback: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the n-th write (0-based, counting both characteristics).
    pub fn fail_write_at(&self, index: usize) {
        self.lock().fail_write_at = Some(index);
    }

    /// Go silent after `count` notifications.
    pub fn mute_notifications_after(&self, count: usize) {
        self.lock().mute_after = Some(count);
    }

    /// Deliver notifications from a separate thread after `delay`.
    pub fn set_notify_delay(&self, delay: Duration) {
        self.lock().notify_delay = Some(delay);
    }

    /// Change the receipt notification window of the emulated device.
    pub fn set_packets_per_ack(&self, packets: usize) {
        self.lock().packets_per_ack = packets;
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<WriteRecord> {
        self.lock()
            .journal
            .iter()
            .filter_map(|e| match e {
                MockEvent::Write(w) => Some(w.clone()),
                MockEvent::Notify(_) => None,
            })
            .collect()
    }

    /// Writes that went to the packet characteristic.
    pub fn data_writes(&self) -> Vec<Vec<u8>> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.target == WriteTarget::Data)
            .map(|w| w.bytes)
            .collect()
    }

    /// Writes that went to the control point.
    pub fn control_writes(&self) -> Vec<Vec<u8>> {
        self.get_writes()
            .into_iter()
            .filter(|w| w.target == WriteTarget::Control)
            .map(|w| w.bytes)
            .collect()
    }

    /// Writes and notifications in observed order.
    pub fn journal(&self) -> Vec<MockEvent> {
        self.lock().journal.clone()
    }

    pub fn notifications_sent(&self) -> usize {
        self.lock().notifications_sent
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    /// Simulate a link loss.
    pub fn drop_link(&self) {
        self.lock().connected = false;
    }

    fn record_write(&self, target: WriteTarget, data: &[u8]) -> Result<(), TransportError> {
        let (pending, delay) = {
            let mut state = self.lock();
            if !state.connected {
                return Err(TransportError::Disconnected);
            }
            let index = state
                .journal
                .iter()
                .filter(|e| matches!(e, MockEvent::Write(_)))
                .count();
            if state.fail_write_at == Some(index) {
                state.connected = false;
                return Err(match target {
                    WriteTarget::Control => {
                        TransportError::ControlWriteFailed("injected failure".into())
                    }
                    WriteTarget::Data => TransportError::DataWriteFailed("injected failure".into()),
                });
            }
            state.journal.push(MockEvent::Write(WriteRecord {
                target,
                bytes: data.to_vec(),
            }));

            let mut pending = match target {
                WriteTarget::Control => state.on_control(data),
                WriteTarget::Data => state.on_data(data),
            };
            pending.retain(|_| state.may_notify());
            (pending, state.notify_delay)
        };

        if pending.is_empty() {
            return Ok(());
        }
        let Some(callback) = self
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return Ok(());
        };

        match delay {
            None => deliver(&self.state, &callback, pending),
            Some(delay) => {
                let state = Arc::clone(&self.state);
                thread::spawn(move || {
                    thread::sleep(delay);
                    deliver(&state, &callback, pending);
                });
            }
        }
        Ok(())
    }
}

fn deliver(
    state: &Arc<Mutex<MockState>>,
    callback: &Arc<NotificationCallback>,
    payloads: Vec<Vec<u8>>,
) {
    for payload in payloads {
        state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .journal
            .push(MockEvent::Notify(payload.clone()));
        callback(&payload);
    }
}

impl MockState {
    fn may_notify(&mut self) -> bool {
        if self.mute_after.is_some_and(|limit| self.notifications_sent >= limit) {
            return false;
        }
        self.notifications_sent += 1;
        true
    }

    fn on_control(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if data == PRE_RECEIVE_MODE {
            return Vec::new();
        }
        match DfuOpcode::from_bytes(data) {
            Some(DfuOpcode::StartDfu) => {
                self.stage = DeviceStage::AwaitingSize;
                Vec::new()
            }
            Some(DfuOpcode::ReceiveFirmwareImage) if self.stage == DeviceStage::SizeReceived => {
                self.stage = DeviceStage::Receiving;
                if self.image_size == 0 {
                    self.stage = DeviceStage::ImageReceived;
                    return vec![vec![0x10, 0x03, 0x01]];
                }
                Vec::new()
            }
            Some(DfuOpcode::ValidateFirmwareImage) if self.stage == DeviceStage::ImageReceived => {
                self.stage = DeviceStage::Validated;
                vec![vec![0x10, 0x04, 0x01]]
            }
            Some(DfuOpcode::ActivateFirmwareAndReset) if self.stage == DeviceStage::Validated => {
                self.stage = DeviceStage::Reset;
                self.connected = false;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_data(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        match self.stage {
            DeviceStage::AwaitingSize => {
                if let Ok(record) = SizeRecord::from_bytes(data) {
                    self.image_size = record.image_size as usize;
                    self.stage = DeviceStage::SizeReceived;
                    return vec![vec![0x10, 0x01, 0x01]];
                }
                Vec::new()
            }
            DeviceStage::Receiving => {
                self.bytes_received += data.len();
                self.packets_since_ack += 1;
                let mut out = Vec::new();
                if self.packets_since_ack == self.packets_per_ack {
                    self.packets_since_ack = 0;
                    let mut prn = vec![0x11];
                    prn.extend_from_slice(&(self.bytes_received as u32).to_le_bytes());
                    out.push(prn);
                }
                if self.bytes_received >= self.image_size {
                    self.stage = DeviceStage::ImageReceived;
                    out.push(vec![0x10, 0x03, 0x01]);
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GattTransport for MockTransport {
    fn write_control(&self, data: &[u8]) -> Result<(), TransportError> {
        self.record_write(WriteTarget::Control, data)
    }

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.record_write(WriteTarget::Data, data)
    }

    fn subscribe_control_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
