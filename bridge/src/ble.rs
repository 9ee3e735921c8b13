//! Bluetooth LE backend on top of btleplug.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use btleplug::{
    api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral as Device},
};
use futures::StreamExt;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use volcano_common::ControlPoint;

use crate::peripheral::{Notifications, Peripheral, PeripheralError};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEVICE_NAME_MARKER: &str = "VOLCANO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: String,
    pub name: String,
}

struct Link {
    device: Device,
    characteristics: HashMap<ControlPoint, Characteristic>,
    points_by_uuid: HashMap<Uuid, ControlPoint>,
    forwarder: Option<JoinHandle<()>>,
}

impl Link {
    fn characteristic(&self, point: ControlPoint) -> Result<Characteristic, PeripheralError> {
        self.characteristics
            .get(&point)
            .cloned()
            .ok_or(PeripheralError::MissingControlPoint { point })
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// The unit at a fixed address. `connect` scans for it for up to `scan`.
pub struct BlePeripheral {
    address: String,
    scan: Duration,
    link: Mutex<Option<Link>>,
}

impl BlePeripheral {
    pub fn new(address: &str, scan: Duration) -> Self {
        Self {
            address: address.to_string(),
            scan,
            link: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().expect("ble link mutex poisoned")
    }

    fn endpoint(&self, point: ControlPoint) -> Result<(Device, Characteristic), PeripheralError> {
        let link = self.lock();
        let link = link.as_ref().ok_or(PeripheralError::NotConnected)?;
        Ok((link.device.clone(), link.characteristic(point)?))
    }

    async fn find(&self, adapter: &Adapter) -> Result<Device, PeripheralError> {
        adapter.start_scan(ScanFilter::default()).await?;
        let deadline = Instant::now() + self.scan;
        let found = loop {
            let found = adapter.peripherals().await?.into_iter().find(|device| {
                device
                    .address()
                    .to_string()
                    .eq_ignore_ascii_case(&self.address)
            });
            if found.is_some() || Instant::now() >= deadline {
                break found;
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };
        if let Err(err) = adapter.stop_scan().await {
            debug!("stop scan failed: {err}");
        }

        found.ok_or_else(|| PeripheralError::DeviceNotFound {
            address: self.address.clone(),
        })
    }
}

async fn first_adapter() -> Result<Adapter, PeripheralError> {
    let manager = Manager::new().await?;
    manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(PeripheralError::NoAdapter)
}

#[async_trait]
impl Peripheral for BlePeripheral {
    async fn connect(&self) -> Result<(), PeripheralError> {
        let adapter = first_adapter().await?;
        info!(
            "scanning up to {}s for {}",
            self.scan.as_secs(),
            self.address
        );
        let device = self.find(&adapter).await?;
        device.connect().await?;
        device.discover_services().await?;

        let mut characteristics = HashMap::new();
        let mut points_by_uuid = HashMap::new();
        for characteristic in device.characteristics() {
            if let Some(point) = ControlPoint::from_uuid(&characteristic.uuid.to_string()) {
                points_by_uuid.insert(characteristic.uuid, point);
                characteristics.insert(point, characteristic);
            }
        }
        for point in ControlPoint::ALL {
            if !characteristics.contains_key(&point) {
                warn!("unit does not expose {point} ({})", point.uuid());
            }
        }

        *self.lock() = Some(Link {
            device,
            characteristics,
            points_by_uuid,
            forwarder: None,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PeripheralError> {
        let link = self.lock().take();
        if let Some(mut link) = link {
            link.stop_forwarder();
            link.device.disconnect().await?;
            info!("disconnected from {}", self.address);
        }
        Ok(())
    }

    async fn write(&self, point: ControlPoint, payload: &[u8]) -> Result<(), PeripheralError> {
        let (device, characteristic) = self.endpoint(point)?;
        debug!("write {point} {payload:02x?}");
        device
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn read(&self, point: ControlPoint) -> Result<Vec<u8>, PeripheralError> {
        let (device, characteristic) = self.endpoint(point)?;
        let raw = device.read(&characteristic).await?;
        debug!("read {point} -> {raw:02x?}");
        Ok(raw)
    }

    async fn subscribe(&self, point: ControlPoint) -> Result<Notifications, PeripheralError> {
        let (device, characteristic) = self.endpoint(point)?;
        device.subscribe(&characteristic).await?;
        let mut stream = device.notifications().await?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut link = self.lock();
        let link = link.as_mut().ok_or(PeripheralError::NotConnected)?;
        let points_by_uuid = link.points_by_uuid.clone();
        link.stop_forwarder();
        link.forwarder = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if points_by_uuid.get(&notification.uuid) != Some(&point) {
                    continue;
                }
                if sender.send(notification.value).is_err() {
                    break;
                }
            }
            debug!("{point} notification stream ended");
        }));
        Ok(receiver)
    }

    async fn unsubscribe(&self, point: ControlPoint) -> Result<(), PeripheralError> {
        let (device, characteristic) = self.endpoint(point)?;
        if let Some(link) = self.lock().as_mut() {
            link.stop_forwarder();
        }
        device.unsubscribe(&characteristic).await?;
        Ok(())
    }
}

/// Scans for `scan` and returns every device advertising a Volcano name.
pub async fn discover(scan: Duration) -> Result<Vec<DiscoveredDevice>, PeripheralError> {
    let adapter = first_adapter().await?;
    info!("scanning for {}s", scan.as_secs());
    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(scan).await;
    if let Err(err) = adapter.stop_scan().await {
        debug!("stop scan failed: {err}");
    }

    let mut devices = Vec::new();
    for device in adapter.peripherals().await? {
        let name = device
            .properties()
            .await?
            .and_then(|properties| properties.local_name);
        if let Some(name) = name.filter(|name| name.to_uppercase().contains(DEVICE_NAME_MARKER)) {
            devices.push(DiscoveredDevice {
                address: device.address().to_string(),
                name,
            });
        }
    }
    Ok(devices)
}
