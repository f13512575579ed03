//! WinRT Bluetooth LE Transport
//!
//! [`Transport`] over the Windows Runtime Bluetooth APIs: advertisement
//! watcher for discovery, a maintained `GattSession` for the connection,
//! and `WriteValueAsync` on the cell characteristic.

use super::transport::{DisconnectNotifier, Link, Transport, TransportError, WriteError};
use crate::domain::settings::DeviceSettings;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::core::{GUID, HRESULT};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCommunicationStatus, GattDeviceService, GattSession,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataWriter;

/// RO_E_CLOSED: the object has been closed.
const RO_E_CLOSED: HRESULT = HRESULT(0x8000_0013_u32 as i32);

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError(e.to_string())
    }
}

pub struct WinRtTransport {
    discovery_timeout: Duration,
    write_timeout: Duration,
}

impl WinRtTransport {
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            discovery_timeout: settings.discovery_timeout(),
            write_timeout: settings.write_timeout(),
        }
    }
}

pub struct WinRtDevice {
    device: BluetoothLEDevice,
    session: Mutex<Option<GattSession>>,
    status_token: Mutex<Option<i64>>,
}

pub struct WinRtLink {
    device: BluetoothLEDevice,
    characteristic: GattCharacteristic,
    write_timeout: Duration,
}

fn is_connected(device: &BluetoothLEDevice) -> bool {
    device
        .ConnectionStatus()
        .map(|s| s == BluetoothConnectionStatus::Connected)
        .unwrap_or(false)
}

#[async_trait]
impl Link for WinRtLink {
    fn is_attached(&self) -> bool {
        is_connected(&self.device)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), WriteError> {
        let buffer = {
            let writer = DataWriter::new().map_err(|e| WriteError::Failed(e.to_string()))?;
            writer
                .WriteBytes(bytes)
                .map_err(|e| WriteError::Failed(e.to_string()))?;
            writer
                .DetachBuffer()
                .map_err(|e| WriteError::Failed(e.to_string()))?
        };

        let operation = self
            .characteristic
            .WriteValueAsync(&buffer)
            .map_err(|e| self.classify(e))?;

        match tokio::time::timeout(self.write_timeout, async move { operation.await }).await {
            Err(_) => Err(WriteError::TimedOut),
            Ok(Err(e)) => Err(self.classify(e)),
            Ok(Ok(GattCommunicationStatus::Success)) => Ok(()),
            Ok(Ok(GattCommunicationStatus::Unreachable)) => Err(WriteError::Detached),
            Ok(Ok(status)) => Err(WriteError::Failed(format!("GATT status {:?}", status))),
        }
    }
}

impl WinRtLink {
    fn classify(&self, e: windows::core::Error) -> WriteError {
        if e.code() == RO_E_CLOSED {
            WriteError::InvalidHandle
        } else if !self.is_attached() {
            WriteError::Detached
        } else {
            WriteError::Failed(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    type Device = WinRtDevice;
    type Service = GattDeviceService;
    type Link = WinRtLink;

    async fn discover(&mut self, name_filter: &str) -> Result<WinRtDevice, TransportError> {
        info!("Starting BLE scan for '{}'", name_filter);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let wanted = name_filter.to_string();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    if name == wanted {
                        let _ = found_tx.send(args.BluetoothAddress()?);
                    }
                }
                Ok(())
            },
        );
        watcher.Received(&handler)?;
        watcher.Start()?;

        let found = tokio::time::timeout(self.discovery_timeout, found_rx.recv()).await;
        if let Err(e) = watcher.Stop() {
            warn!("Failed to stop advertisement watcher: {}", e);
        }

        let address = match found {
            Ok(Some(address)) => address,
            Ok(None) => return Err(TransportError::new("scan ended without a match")),
            Err(_) => {
                return Err(TransportError::new(format!(
                    "no advertisement within {:?}",
                    self.discovery_timeout
                )))
            }
        };
        info!("Found '{}' at {:#X}", name_filter, address);

        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
        Ok(WinRtDevice {
            device,
            session: Mutex::new(None),
            status_token: Mutex::new(None),
        })
    }

    async fn connect_transport(&mut self, device: &WinRtDevice) -> Result<(), TransportError> {
        let device_id = device.device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        debug!("GattSession created, MaintainConnection set");
        if let Ok(mut slot) = device.session.lock() {
            *slot = Some(session);
        }
        Ok(())
    }

    fn subscribe_disconnect(
        &mut self,
        device: &WinRtDevice,
        notifier: DisconnectNotifier,
    ) -> Result<(), TransportError> {
        let handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        notifier.notify();
                    }
                }
                Ok(())
            });
        let token = device.device.ConnectionStatusChanged(&handler)?;
        if let Ok(mut slot) = device.status_token.lock() {
            *slot = Some(token);
        }
        Ok(())
    }

    async fn get_service(
        &mut self,
        device: &WinRtDevice,
        id: u128,
    ) -> Result<GattDeviceService, TransportError> {
        let result = device
            .device
            .GetGattServicesForUuidAsync(GUID::from_u128(id))?
            .await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::new(format!("GATT status {:?}", status)));
        }

        let services = result.Services()?;
        if services.Size()? == 0 {
            return Err(TransportError::new("service not offered by device"));
        }
        Ok(services.GetAt(0)?)
    }

    async fn get_characteristic(
        &mut self,
        service: &GattDeviceService,
        id: u128,
    ) -> Result<WinRtLink, TransportError> {
        let result = service
            .GetCharacteristicsForUuidAsync(GUID::from_u128(id))?
            .await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::new(format!("GATT status {:?}", status)));
        }

        let characteristics = result.Characteristics()?;
        if characteristics.Size()? == 0 {
            return Err(TransportError::new("characteristic not offered by service"));
        }

        Ok(WinRtLink {
            device: service.Device()?,
            characteristic: characteristics.GetAt(0)?,
            write_timeout: self.write_timeout,
        })
    }

    async fn close(&mut self, device: WinRtDevice) {
        let token = device.status_token.lock().ok().and_then(|mut t| t.take());
        if let Some(token) = token {
            let _ = device.device.RemoveConnectionStatusChanged(token);
        }
        let session = device.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            let _ = session.Close();
        }
        if let Err(e) = device.device.Close() {
            warn!("Failed to close device: {}", e);
        }
    }
}
