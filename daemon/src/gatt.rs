//! The seam between upload logic and the Bluetooth stack.
//!
//! Everything above this module talks to a display through [`BleCentral`]
//! and [`BlePeripheral`]; `ble.rs` implements them with btleplug.

use std::time::Duration;

use async_trait::async_trait;
use pricetag::DeviceAddress;
use pricetag::protocol::Channel;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("no bluetooth adapter at index {0}")]
    NoAdapter(usize),
    #[error("bluetooth error: {0}")]
    Bluetooth(String),
    #[error("scan failed: {0}")]
    Scan(String),
    #[error("{0} not seen in scan")]
    NotFound(DeviceAddress),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),
    #[error("failed to subscribe to notifications: {0}")]
    Subscribe(String),
    #[error("write to {channel:?} channel failed: {reason}")]
    Write { channel: Channel, reason: String },
}

/// What a scan saw of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: DeviceAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

#[async_trait]
pub trait BleCentral: Send + Sync {
    type Peripheral: BlePeripheral + 'static;

    /// Scan for `duration` and return every device seen.
    async fn scan(&self, duration: Duration) -> Result<Vec<Self::Peripheral>, GattError>;
}

#[async_trait]
pub trait BlePeripheral: Send + Sync {
    fn advertisement(&self) -> &Advertisement;

    /// Connect and discover services.
    async fn connect(&self) -> Result<(), GattError>;

    /// Subscribe to the command channel. Notification payloads arrive on
    /// the returned receiver, which closes when the link goes away.
    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, GattError>;

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), GattError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), GattError>;
}
