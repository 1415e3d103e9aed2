//! [`BleCentral`] and [`BlePeripheral`] on top of btleplug.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use log::{debug, info, warn};
use pricetag::DeviceAddress;
use pricetag::protocol::{COMMAND_CHAR_UUID, Channel};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::gatt::{Advertisement, BleCentral, BlePeripheral, GattError};

const NOTIFICATION_BUFFER: usize = 64;

pub struct BtleCentral {
    adapter: Adapter,
}

impl BtleCentral {
    pub async fn new(adapter_index: usize) -> Result<Self, GattError> {
        let manager = Manager::new()
            .await
            .map_err(|e| GattError::Bluetooth(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| GattError::Bluetooth(e.to_string()))?
            .into_iter()
            .nth(adapter_index)
            .ok_or(GattError::NoAdapter(adapter_index))?;
        match adapter.adapter_info().await {
            Ok(info) => info!("using bluetooth adapter {info}"),
            Err(e) => warn!("couldn't read adapter info: {e}"),
        }
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BleCentral for BtleCentral {
    type Peripheral = BtlePeripheral;

    async fn scan(&self, duration: Duration) -> Result<Vec<BtlePeripheral>, GattError> {
        // the adapter caches every device it has ever seen, so only report
        // the ones that advertised while this scan was running
        let events = self
            .adapter
            .events()
            .await
            .map_err(|e| GattError::Scan(e.to_string()))?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| GattError::Scan(e.to_string()))?;
        let seen = collect_during(events.filter_map(advertised_id), duration).await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("failed to stop scan: {e}");
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| GattError::Scan(e.to_string()))?;
        let mut found = Vec::with_capacity(seen.len());
        for peripheral in peripherals {
            if !seen.contains(&peripheral.id()) {
                continue;
            }
            let Some(props) = peripheral.properties().await.ok().flatten() else {
                continue;
            };
            if props.rssi.is_none() {
                continue;
            }
            let advertisement = Advertisement {
                address: DeviceAddress::new(props.address.into_inner()),
                name: props.local_name,
                rssi: props.rssi,
            };
            found.push(BtlePeripheral {
                inner: peripheral,
                advertisement,
            });
        }
        Ok(found)
    }
}

/// The peripheral an event shows to be advertising, if any.
fn advertised_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id)
        | CentralEvent::DeviceUpdated(id)
        | CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// Everything `stream` yields within `window`. Always takes the whole window,
/// even if the stream ends early.
async fn collect_during<S, T>(mut stream: S, window: Duration) -> HashSet<T>
where
    S: Stream<Item = T> + Unpin,
    T: Eq + Hash,
{
    let mut seen = HashSet::new();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            item = stream.next() => match item {
                Some(item) => {
                    seen.insert(item);
                }
                None => {
                    (&mut deadline).await;
                    break;
                }
            },
        }
    }
    seen
}

#[derive(Clone)]
pub struct BtlePeripheral {
    inner: Peripheral,
    advertisement: Advertisement,
}

impl BtlePeripheral {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, GattError> {
        self.inner
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(GattError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl BlePeripheral for BtlePeripheral {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    async fn connect(&self) -> Result<(), GattError> {
        self.inner
            .connect()
            .await
            .map_err(|e| GattError::Connect(e.to_string()))?;
        self.inner
            .discover_services()
            .await
            .map_err(|e| GattError::Connect(format!("service discovery failed: {e}")))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, GattError> {
        let characteristic = self.characteristic(COMMAND_CHAR_UUID)?;
        let mut stream = self
            .inner
            .notifications()
            .await
            .map_err(|e| GattError::Subscribe(e.to_string()))?;
        self.inner
            .subscribe(&characteristic)
            .await
            .map_err(|e| GattError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let address = self.advertisement.address;
        tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != COMMAND_CHAR_UUID {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            debug!("notification stream from {address} ended");
        });
        Ok(rx)
    }

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), GattError> {
        let characteristic = self.characteristic(channel.uuid())?;
        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.inner
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| GattError::Write {
                channel,
                reason: e.to_string(),
            })
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), GattError> {
        self.inner
            .disconnect()
            .await
            .map_err(|e| GattError::Bluetooth(e.to_string()))
    }
}
