//! Finding a display by address and bringing up a subscribed link to it.

use std::time::Duration;

use log::{debug, info, warn};
use pricetag::DeviceAddress;
use pricetag::retry::{RetryError, RetryPolicy, retry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;
use crate::gatt::{BleCentral, BlePeripheral, GattError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkSettings {
    pub scan: RetryPolicy,
    /// How long each scan listens for advertisements.
    pub scan_duration: Duration,
    pub connect: RetryPolicy,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            scan: RetryPolicy::fixed(10, Duration::from_secs(8), Duration::from_secs(3)),
            scan_duration: Duration::from_secs(5),
            connect: RetryPolicy::fixed(10, Duration::from_secs(15), Duration::from_secs(2)),
        }
    }
}

/// A connected display with its command channel notifications.
pub struct Connection<P> {
    pub peripheral: P,
    pub notifications: mpsc::Receiver<Vec<u8>>,
}

pub struct ConnectionManager<C> {
    central: C,
    settings: LinkSettings,
}

impl<C: BleCentral> ConnectionManager<C> {
    pub fn new(central: C, settings: LinkSettings) -> Self {
        Self { central, settings }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    /// Scan for `address` and connect to it, each stage under its own retry
    /// budget.
    pub async fn connect(
        &self,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<Connection<C::Peripheral>, UploadError> {
        info!("looking for display {address}");
        let peripheral = self.discover(address, cancel).await?;
        let ad = peripheral.advertisement();
        info!(
            "found {} ({}), RSSI: {:?}",
            ad.name.as_deref().unwrap_or("Unknown"),
            ad.address,
            ad.rssi
        );
        let notifications = self.establish(&peripheral, cancel).await?;
        info!("connected to {address}");
        Ok(Connection {
            peripheral,
            notifications,
        })
    }

    async fn discover(
        &self,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<C::Peripheral, UploadError> {
        let scan_duration = self.settings.scan_duration;
        let result = retry(&self.settings.scan, "discovery", cancel, |attempt| async move {
            debug!("starting BLE scan for {address} (attempt {attempt})");
            let peripherals = self.central.scan(scan_duration).await?;
            debug!("scan complete, found {} devices", peripherals.len());
            for peripheral in &peripherals {
                let ad = peripheral.advertisement();
                debug!(
                    "  - {} ({}) RSSI: {:?}",
                    ad.name.as_deref().unwrap_or("Unknown"),
                    ad.address,
                    ad.rssi
                );
            }
            peripherals
                .into_iter()
                .find(|p| p.advertisement().address == address)
                .ok_or(GattError::NotFound(address))
        })
        .await;

        match result {
            Ok(peripheral) => Ok(peripheral),
            Err(RetryError::Cancelled { .. }) => Err(UploadError::Cancelled),
            Err(RetryError::Exhausted { attempts, .. }) => {
                Err(UploadError::DeviceNotFound { address, attempts })
            }
        }
    }

    async fn establish(
        &self,
        peripheral: &C::Peripheral,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<Vec<u8>>, UploadError> {
        let address = peripheral.advertisement().address;
        let result = retry(&self.settings.connect, "connection", cancel, |attempt| async move {
            // an earlier attempt may have timed out halfway through
            if attempt > 1 {
                drop_link(peripheral).await;
            }
            debug!("connecting to {address} (attempt {attempt})");
            peripheral.connect().await?;
            match peripheral.subscribe().await {
                Ok(notifications) => Ok(notifications),
                Err(e) => {
                    drop_link(peripheral).await;
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(notifications) => Ok(notifications),
            Err(RetryError::Cancelled { .. }) => {
                drop_link(peripheral).await;
                Err(UploadError::Cancelled)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                // the last attempt can time out after the link came up
                drop_link(peripheral).await;
                Err(UploadError::ConnectionFailed {
                    address,
                    attempts,
                    reason: last.to_string(),
                })
            }
        }
    }
}

/// Disconnect `peripheral` if it is still connected.
async fn drop_link<P: BlePeripheral>(peripheral: &P) {
    if peripheral.is_connected().await
        && let Err(e) = peripheral.disconnect().await
    {
        warn!(
            "failed to disconnect from {}: {e}",
            peripheral.advertisement().address
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCentral, MockDisplay};
    use tokio::time::Instant;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_after_exactly_max_scans() {
        let central = MockCentral::new(vec![MockDisplay::new(addr("11:22:33:44:55:66"))]);
        let scans = central.scan_counter();
        let manager = ConnectionManager::new(central, LinkSettings::default());

        let start = Instant::now();
        let result = manager
            .connect(addr("AA:BB:CC:DD:EE:FF"), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(UploadError::DeviceNotFound { attempts: 10, .. })
        ));
        assert_eq!(scans.get(), 10);
        // ten 5s scans and nine 3s backoffs
        assert_eq!(start.elapsed(), Duration::from_secs(10 * 5 + 9 * 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_appearing_late_is_found() {
        let display = MockDisplay::new(addr("AA:BB:CC:DD:EE:FF"));
        let central = MockCentral::new(vec![display.clone()]).visible_from_scan(3);
        let scans = central.scan_counter();
        let manager = ConnectionManager::new(central, LinkSettings::default());

        let connection = manager
            .connect(addr("aa:bb:cc:dd:ee:ff"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(scans.get(), 3);
        assert_eq!(
            connection.peripheral.advertisement().address,
            addr("AA:BB:CC:DD:EE:FF")
        );
        assert!(display.is_link_up());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let display = MockDisplay::new(addr("AA:BB:CC:DD:EE:FF")).failing_connects(2);
        let manager = ConnectionManager::new(
            MockCentral::new(vec![display.clone()]),
            LinkSettings::default(),
        );
        manager
            .connect(addr("AA:BB:CC:DD:EE:FF"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(display.connect_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failed_after_budget() {
        let display = MockDisplay::new(addr("AA:BB:CC:DD:EE:FF")).failing_connects(u32::MAX);
        let manager = ConnectionManager::new(
            MockCentral::new(vec![display.clone()]),
            LinkSettings::default(),
        );
        let result = manager
            .connect(addr("AA:BB:CC:DD:EE:FF"), &CancellationToken::new())
            .await;
        let Err(UploadError::ConnectionFailed {
            attempts, reason, ..
        }) = result
        else {
            panic!("expected ConnectionFailed");
        };
        assert_eq!(attempts, 10);
        assert!(reason.contains("refused"), "{reason}");
        assert_eq!(display.connect_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_dropped_when_last_attempt_stalls_after_connect() {
        let display = MockDisplay::new(addr("AA:BB:CC:DD:EE:FF")).stalling_subscribe();
        let manager = ConnectionManager::new(
            MockCentral::new(vec![display.clone()]),
            LinkSettings::default(),
        );
        let result = manager
            .connect(addr("AA:BB:CC:DD:EE:FF"), &CancellationToken::new())
            .await;
        let Err(UploadError::ConnectionFailed {
            attempts, reason, ..
        }) = &result
        else {
            panic!("expected ConnectionFailed, got {:?}", result.err());
        };
        assert_eq!(*attempts, 10);
        assert!(reason.contains("timed out"), "{reason}");
        assert_eq!(display.connect_calls(), 10);
        assert!(!display.is_link_up());
        assert!(display.links().iter().all(|(_, end)| end.is_some()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_discovery() {
        let manager = ConnectionManager::new(MockCentral::new(Vec::new()), LinkSettings::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });
        let result = manager.connect(addr("AA:BB:CC:DD:EE:FF"), &cancel).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
    }
}
