//! DFU Session - drives one upload from START_DFU to activation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::UploadError;
use crate::events::{Channel, DfuEvent, DfuObserver, LogLevel, TracingObserver};
use crate::flow::FlowController;
use crate::protocol::constants::{
    ACK_TIMEOUT, PACKET_INTERVAL, PACKETS_PER_ACK, PRE_RECEIVE_MODE, SCAN_TIMEOUT,
};
use crate::protocol::{DfuOpcode, SizeRecord, hex_string};
use crate::state::{DfuState, SessionState};
use crate::sync::NotificationSynchronizer;
use crate::transport::GattTransport;

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for each acknowledgment, in milliseconds.
    pub ack_timeout_ms: u64,
    /// Minimum gap between data packets, in milliseconds.
    pub packet_interval_ms: u64,
    /// Data packets between receipt notifications.
    pub packets_per_ack: usize,
    /// Only connect to a device with this advertised name.
    pub device_name: Option<String>,
    /// Only connect to a device with this address.
    pub device_address: Option<String>,
    /// How long to scan for a target, in seconds.
    pub scan_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: ACK_TIMEOUT.as_millis() as u64,
            packet_interval_ms: PACKET_INTERVAL.as_millis() as u64,
            packets_per_ack: PACKETS_PER_ACK,
            device_name: None,
            device_address: None,
            scan_timeout_secs: SCAN_TIMEOUT.as_secs(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn flow(&self) -> FlowController {
        FlowController::new(
            self.packets_per_ack,
            Duration::from_millis(self.packet_interval_ms),
        )
    }
}

/// Summary of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub bytes_sent: usize,
    pub packets_sent: usize,
    pub acks_received: usize,
    pub elapsed: Duration,
}

/// Cancels an upload from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sync: Arc<NotificationSynchronizer>,
}

impl CancelHandle {
    /// Interrupt a pending acknowledgment wait, or stop before the next write.
    pub fn cancel(&self) {
        info!("Upload cancellation requested");
        self.sync.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.sync.is_cancelled()
    }
}

/// DFU Session - one upload attempt over one connection.
pub struct DfuSession<'a, T: GattTransport, O: DfuObserver> {
    transport: &'a T,
    observer: Arc<O>,
    sync: Arc<NotificationSynchronizer>,
    flow: FlowController,
    ack_timeout: Duration,
    state: SessionState,
}

impl<'a, T: GattTransport> DfuSession<'a, T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(transport: &'a T, config: &SessionConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<'a, T: GattTransport, O: DfuObserver + 'static> DfuSession<'a, T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(transport: &'a T, config: &SessionConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            observer,
            sync: Arc::new(NotificationSynchronizer::new()),
            flow: config.flow(),
            ack_timeout: config.ack_timeout(),
            state: SessionState::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sync: Arc::clone(&self.sync),
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> DfuState {
        self.state.state
    }

    /// Upload `image` and activate it. Blocks until done or failed.
    ///
    /// On success the device resets into the new firmware and the link
    /// drops; that is not reported as an error.
    #[instrument(skip(self, image), fields(size = image.len()))]
    pub fn upload(&mut self, image: &[u8]) -> Result<UploadReport, UploadError> {
        let started = Instant::now();
        self.state = SessionState::new();

        match self.run(image) {
            Ok(()) => {
                let report = UploadReport {
                    bytes_sent: self.state.bytes_sent,
                    packets_sent: self.state.packets_sent,
                    acks_received: self.state.acks_received,
                    elapsed: started.elapsed(),
                };
                info!(
                    bytes = report.bytes_sent,
                    packets = report.packets_sent,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Upload complete"
                );
                Ok(report)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn run(&mut self, image: &[u8]) -> Result<(), UploadError> {
        // Size is checked before anything touches the device.
        let record = SizeRecord::new(image.len())?;
        if self.sync.is_cancelled() {
            return Err(UploadError::Cancelled {
                state: self.state.state,
            });
        }
        self.subscribe()?;

        self.advance(DfuState::AwaitingStart)?;
        self.write_control(DfuOpcode::StartDfu.as_bytes())?;

        self.advance(DfuState::SizeSent)?;
        self.arm(1)?;
        self.write_data(&record.to_bytes())?;
        self.advance(DfuState::AwaitingSizeAck)?;
        self.wait_ack()?;

        self.advance(DfuState::ReceiveModeSet)?;
        self.write_control(&PRE_RECEIVE_MODE)?;
        if image.is_empty() {
            // Nothing to stream: the end-of-image ack follows RECEIVE.
            self.arm(1)?;
        }
        self.write_control(DfuOpcode::ReceiveFirmwareImage.as_bytes())?;

        self.advance(DfuState::Streaming)?;
        self.stream(image)?;

        self.advance(DfuState::AwaitingFinalAck)?;
        self.wait_ack()?;

        self.advance(DfuState::Validating)?;
        self.arm(1)?;
        self.write_control(DfuOpcode::ValidateFirmwareImage.as_bytes())?;
        self.advance(DfuState::AwaitingValidateAck)?;
        self.wait_ack()?;

        self.advance(DfuState::Activating)?;
        self.write_control(DfuOpcode::ActivateFirmwareAndReset.as_bytes())?;
        self.sync.disarm();
        self.advance(DfuState::Done)?;
        self.emit(DfuEvent::Complete);
        Ok(())
    }

    fn stream(&mut self, image: &[u8]) -> Result<(), UploadError> {
        let total = image.len();
        let mut pacer = self.flow.pacer();
        info!(
            bytes = total,
            packets = self.flow.plan(total).packets,
            "Streaming image"
        );

        for packet in self.flow.packets(image) {
            if self.sync.is_cancelled() {
                return Err(UploadError::Cancelled {
                    state: self.state.state,
                });
            }
            // The last packet triggers the end-of-image ack. When it also
            // closes a window, one capture window covers both acks.
            let expected = usize::from(packet.requires_ack) + usize::from(packet.is_last);
            if expected > 0 {
                self.arm(expected)?;
            }

            pacer.wait_turn();
            self.write_data(packet.bytes)?;
            pacer.mark();
            self.state.record_packet(packet.bytes.len());

            if packet.requires_ack {
                trace!(packet = packet.index, "Window closed, waiting for receipt");
                self.wait_ack()?;
                self.emit(DfuEvent::Progress {
                    bytes_sent: self.state.bytes_sent,
                    total,
                });
            }
        }

        if self.state.bytes_sent != total {
            return Err(UploadError::ProtocolViolation {
                state: self.state.state,
                message: format!("streamed {} of {} bytes", self.state.bytes_sent, total),
            });
        }
        self.emit(DfuEvent::Progress {
            bytes_sent: total,
            total,
        });
        Ok(())
    }

    fn subscribe(&self) -> Result<(), UploadError> {
        let sync = Arc::clone(&self.sync);
        let observer = Arc::clone(&self.observer);
        self.transport
            .subscribe_control_notifications(Box::new(move |payload| {
                observer.on_event(&DfuEvent::Packet {
                    channel: Channel::Notify,
                    length: payload.len(),
                    data: Some(payload.to_vec()),
                });
                sync.on_notify(payload);
            }))
            .map_err(|source| UploadError::Transport {
                state: self.state.state,
                source,
            })?;
        debug!("Subscribed to control point notifications");
        Ok(())
    }

    fn advance(&mut self, to: DfuState) -> Result<(), UploadError> {
        let from = self.state.state;
        if !self.state.goto_state(to) {
            return Err(UploadError::ProtocolViolation {
                state: from,
                message: format!("illegal transition to {}", to),
            });
        }
        self.emit(DfuEvent::StateChanged { from, to });
        Ok(())
    }

    fn arm(&mut self, expected: usize) -> Result<(), UploadError> {
        if self.state.acks_expected > 0 {
            return Err(UploadError::ProtocolViolation {
                state: self.state.state,
                message: format!(
                    "arm with {} acknowledgment(s) outstanding",
                    self.state.acks_expected
                ),
            });
        }
        self.sync
            .arm_expecting(expected)
            .map_err(|e| UploadError::from_sync(self.state.state, e))?;
        self.state.acks_expected = expected;
        Ok(())
    }

    fn wait_ack(&mut self) -> Result<(), UploadError> {
        let payload = self
            .sync
            .wait(self.ack_timeout)
            .map_err(|e| UploadError::from_sync(self.state.state, e))?;
        self.state.record_ack();
        debug!(state = %self.state.state, payload = %hex_string(&payload), "Acknowledged");
        self.emit(DfuEvent::AckReceived { payload });
        Ok(())
    }

    fn write_control(&self, data: &[u8]) -> Result<(), UploadError> {
        self.transport
            .write_control(data)
            .map_err(|source| UploadError::Transport {
                state: self.state.state,
                source,
            })?;
        debug!(value = %hex_string(data), "Sent control packet");
        self.emit(DfuEvent::Packet {
            channel: Channel::Control,
            length: data.len(),
            data: Some(data.to_vec()),
        });
        Ok(())
    }

    fn write_data(&self, data: &[u8]) -> Result<(), UploadError> {
        self.transport
            .write_data(data)
            .map_err(|source| UploadError::Transport {
                state: self.state.state,
                source,
            })?;
        trace!(value = %hex_string(data), "Sent data packet");
        self.emit(DfuEvent::Packet {
            channel: Channel::Data,
            length: data.len(),
            data: Some(data.to_vec()),
        });
        Ok(())
    }

    fn fail(&mut self, err: UploadError) -> UploadError {
        self.state.abort();
        self.sync.disarm();
        if err.needs_disconnect() {
            if let Err(e) = self.transport.disconnect() {
                warn!(error = %e, "Disconnect after failure also failed");
            }
        }
        self.emit(DfuEvent::Error {
            message: err.to_string(),
        });
        self.log(LogLevel::Error, format!("Upload aborted: {}", err));
        err
    }

    fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }
}

/// Upload `image` over `transport` with default settings.
pub fn upload<T: GattTransport>(transport: &T, image: &[u8]) -> Result<UploadReport, UploadError> {
    DfuSession::new(transport, &SessionConfig::default()).upload(image)
}
