//! btleplug-based GATT transport implementation.
//!
//! btleplug is async; this transport owns a small tokio runtime and blocks
//! on it per call, so the upload sequence stays synchronous. Notifications
//! are pumped by a task on that runtime and reach the callback on one of
//! its worker threads.

use std::sync::Mutex;
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::traits::{GattTransport, NotificationCallback, TransportError};
use crate::protocol::constants::{
    DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID, DFU_SERVICE_UUID, SCAN_TIMEOUT,
};

const SCAN_POLL: Duration = Duration::from_millis(250);

/// Which device to connect to.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Substring of the advertised name.
    pub name: Option<String>,
    /// Device address, case-insensitive.
    pub address: Option<String>,
    pub timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            name: None,
            address: None,
            timeout: SCAN_TIMEOUT,
        }
    }
}

impl ScanOptions {
    fn matches(&self, name: Option<&str>, address: &str) -> bool {
        let name_ok = match &self.name {
            Some(wanted) => name.is_some_and(|n| n.contains(wanted.as_str())),
            None => true,
        };
        let address_ok = match &self.address {
            Some(wanted) => address.eq_ignore_ascii_case(wanted),
            None => true,
        };
        name_ok && address_ok
    }
}

/// A DFU-capable peripheral seen while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
}

/// btleplug-based GATT transport.
pub struct BtleplugTransport {
    runtime: Runtime,
    peripheral: Peripheral,
    control: Characteristic,
    packet: Characteristic,
    address: String,
    notify_task: Mutex<Option<JoinHandle<()>>>,
}

fn new_runtime() -> Result<Runtime, TransportError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| TransportError::Ble(e.to_string()))
}

fn ble_err(e: btleplug::Error) -> TransportError {
    match e {
        btleplug::Error::NotConnected => TransportError::Disconnected,
        other => TransportError::Ble(other.to_string()),
    }
}

async fn default_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await.map_err(ble_err)?;
    let adapter = manager
        .adapters()
        .await
        .map_err(ble_err)?
        .into_iter()
        .next()
        .ok_or(TransportError::NoAdapter)?;
    if let Ok(info) = adapter.adapter_info().await {
        info!(adapter = %info, "Using adapter");
    }
    Ok(adapter)
}

async fn advertises_dfu(peripheral: &Peripheral) -> Result<Option<DiscoveredDevice>, TransportError> {
    let Some(props) = peripheral.properties().await.map_err(ble_err)? else {
        return Ok(None);
    };
    if !props.services.contains(&DFU_SERVICE_UUID) {
        return Ok(None);
    }
    Ok(Some(DiscoveredDevice {
        name: props.local_name,
        address: peripheral.address().to_string(),
        rssi: props.rssi,
    }))
}

/// Keep DFU advertisers, skipping peripherals whose properties could not be read.
fn keep_dfu_devices<P>(
    seen: Vec<(P, Result<Option<DiscoveredDevice>, TransportError>)>,
) -> Vec<(P, DiscoveredDevice)> {
    seen.into_iter()
        .filter_map(|(peripheral, result)| match result {
            Ok(device) => device.map(|d| (peripheral, d)),
            Err(e) => {
                debug!(error = %e, "Skipping unreadable peripheral");
                None
            }
        })
        .collect()
}

async fn dfu_peripherals(
    adapter: &Adapter,
) -> Result<Vec<(Peripheral, DiscoveredDevice)>, TransportError> {
    let mut seen = Vec::new();
    for peripheral in adapter.peripherals().await.map_err(ble_err)? {
        let result = advertises_dfu(&peripheral).await;
        seen.push((peripheral, result));
    }
    Ok(keep_dfu_devices(seen))
}

async fn stop_scan(adapter: &Adapter) {
    if let Err(e) = adapter.stop_scan().await {
        warn!(error = %e, "Failed to stop scan");
    }
}

/// Drop links to DFU targets left over from an earlier run.
async fn disconnect_stale(adapter: &Adapter) -> Result<(), TransportError> {
    for (peripheral, _) in dfu_peripherals(adapter).await? {
        if !peripheral.is_connected().await.unwrap_or(false) {
            continue;
        }
        info!(address = %peripheral.address(), "Disconnecting stale DFU device");
        if let Err(e) = peripheral.disconnect().await {
            warn!(address = %peripheral.address(), error = %e, "Failed to disconnect stale device");
        }
    }
    Ok(())
}

async fn poll_for_target(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<(Peripheral, DiscoveredDevice), TransportError> {
    let deadline = tokio::time::Instant::now() + options.timeout;
    loop {
        let hit = dfu_peripherals(adapter)
            .await?
            .into_iter()
            .find(|(_, device)| options.matches(device.name.as_deref(), &device.address));
        if let Some(hit) = hit {
            return Ok(hit);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TransportError::DeviceNotFound {
                timeout_secs: options.timeout.as_secs(),
            });
        }
        tokio::time::sleep(SCAN_POLL).await;
    }
}

async fn find_target(
    adapter: &Adapter,
    options: &ScanOptions,
) -> Result<(Peripheral, DiscoveredDevice), TransportError> {
    adapter
        .start_scan(ScanFilter {
            services: vec![DFU_SERVICE_UUID],
        })
        .await
        .map_err(ble_err)?;

    // Once started, scanning stops on every exit path.
    let found = poll_for_target(adapter, options).await;
    stop_scan(adapter).await;
    found
}

impl BtleplugTransport {
    /// Scan for a DFU target, connect, and locate the DFU characteristics.
    #[instrument(level = "info", skip(options), fields(name = ?options.name, address = ?options.address))]
    pub fn connect(options: &ScanOptions) -> Result<Self, TransportError> {
        let runtime = new_runtime()?;

        let (peripheral, device) = runtime.block_on(async {
            let adapter = default_adapter().await?;
            disconnect_stale(&adapter).await?;
            info!("Searching for DFU device...");
            find_target(&adapter, options).await
        })?;

        info!(
            name = device.name.as_deref().unwrap_or("<unnamed>"),
            address = %device.address,
            rssi = ?device.rssi,
            "Found device, connecting"
        );

        runtime.block_on(async {
            peripheral
                .connect()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            debug!("Discovering services...");
            peripheral
                .discover_services()
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))
        })?;

        let characteristics = peripheral.characteristics();
        let find = |uuid: Uuid| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid && c.service_uuid == DFU_SERVICE_UUID)
                .cloned()
                .ok_or_else(|| TransportError::CharacteristicNotFound(uuid.to_string()))
        };
        let control = find(DFU_CONTROL_POINT_UUID)?;
        let packet = find(DFU_PACKET_UUID)?;

        info!(address = %device.address, "Device connected");
        Ok(Self {
            runtime,
            peripheral,
            control,
            packet,
            address: device.address,
            notify_task: Mutex::new(None),
        })
    }

    /// List DFU-capable devices seen within `duration`.
    pub fn scan(duration: Duration) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let runtime = new_runtime()?;
        runtime.block_on(async {
            let adapter = default_adapter().await?;
            adapter
                .start_scan(ScanFilter {
                    services: vec![DFU_SERVICE_UUID],
                })
                .await
                .map_err(ble_err)?;
            tokio::time::sleep(duration).await;

            let devices = dfu_peripherals(&adapter).await;
            stop_scan(&adapter).await;
            Ok(devices?.into_iter().map(|(_, device)| device).collect())
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<(), btleplug::Error> {
        self.runtime
            .block_on(self.peripheral.write(characteristic, data, write_type))
    }
}

impl GattTransport for BtleplugTransport {
    fn write_control(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(&self.control, data, WriteType::WithResponse)
            .map_err(|e| match e {
                btleplug::Error::NotConnected => TransportError::Disconnected,
                other => TransportError::ControlWriteFailed(other.to_string()),
            })
    }

    fn write_data(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(&self.packet, data, WriteType::WithoutResponse)
            .map_err(|e| match e {
                btleplug::Error::NotConnected => TransportError::Disconnected,
                other => TransportError::DataWriteFailed(other.to_string()),
            })
    }

    fn subscribe_control_notifications(
        &self,
        callback: NotificationCallback,
    ) -> Result<(), TransportError> {
        let mut stream = self.runtime.block_on(async {
            self.peripheral
                .subscribe(&self.control)
                .await
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))?;
            self.peripheral
                .notifications()
                .await
                .map_err(|e| TransportError::SubscribeFailed(e.to_string()))
        })?;

        let task = self.runtime.spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == DFU_CONTROL_POINT_UUID {
                    callback(&notification.value);
                }
            }
            debug!("Notification stream ended");
        });

        let mut slot = self.notify_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(task) = self
            .notify_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        info!(address = %self.address, "Disconnecting");
        self.runtime
            .block_on(self.peripheral.disconnect())
            .map_err(ble_err)
    }

    fn is_connected(&self) -> bool {
        self.runtime
            .block_on(self.peripheral.is_connected())
            .unwrap_or(false)
    }
}
