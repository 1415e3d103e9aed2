//! In-memory displays for tests. [`MockDisplay`] answers writes the way the
//! panel firmware does, with knobs for the ways a real one misbehaves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pricetag::DeviceAddress;
use pricetag::protocol::Channel;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::gatt::{Advertisement, BleCentral, BlePeripheral, GattError};

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU32>);

impl Counter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn incr(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct MockCentral {
    displays: Vec<MockDisplay>,
    scans: Counter,
    visible_from: u32,
}

impl MockCentral {
    pub fn new(displays: Vec<MockDisplay>) -> Self {
        Self {
            displays,
            scans: Counter::default(),
            visible_from: 1,
        }
    }

    /// Only report the displays from the given (1-based) scan onwards.
    pub fn visible_from_scan(mut self, scan: u32) -> Self {
        self.visible_from = scan;
        self
    }

    pub fn scan_counter(&self) -> Counter {
        self.scans.clone()
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    type Peripheral = MockDisplay;

    async fn scan(&self, duration: Duration) -> Result<Vec<MockDisplay>, GattError> {
        tokio::time::sleep(duration).await;
        if self.scans.incr() < self.visible_from {
            return Ok(Vec::new());
        }
        Ok(self.displays.clone())
    }
}

struct DisplayState {
    requested_size: u16,
    connect_failures: u32,
    connect_calls: u32,
    connected: bool,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    expected_len: Option<u32>,
    received: Vec<(u32, Vec<u8>)>,
    commands: Vec<Vec<u8>>,
    fail_at: Option<(u32, u8)>,
    silent_after: Option<u32>,
    silent: bool,
    write_failures: u32,
    stay_connected: bool,
    stall_subscribe: bool,
    links: Vec<(Instant, Option<Instant>)>,
}

impl DisplayState {
    fn ack(part: u32) -> Vec<u8> {
        let mut v = vec![0x05, 0x00];
        v.extend_from_slice(&part.to_le_bytes());
        v
    }

    fn drop_link(&mut self) {
        self.connected = false;
        self.tx = None;
        if let Some((_, end @ None)) = self.links.last_mut() {
            *end = Some(Instant::now());
        }
    }

    fn on_write(&mut self, channel: Channel, bytes: &[u8]) -> Result<Vec<Vec<u8>>, GattError> {
        if !self.connected {
            return Err(GattError::Write {
                channel,
                reason: "not connected".to_string(),
            });
        }
        match channel {
            Channel::Command => {
                self.commands.push(bytes.to_vec());
                match bytes[0] {
                    0x01 => {
                        self.received.clear();
                        self.expected_len = None;
                        Ok(Vec::new())
                    }
                    0x02 => {
                        self.expected_len =
                            Some(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]));
                        let size = self.requested_size.to_le_bytes();
                        Ok(vec![vec![0x01, size[0], size[1]], vec![0x02]])
                    }
                    0x03 => Ok(vec![Self::ack(0)]),
                    other => panic!("unexpected command {other:#04x}"),
                }
            }
            Channel::Image => {
                if self.write_failures > 0 {
                    self.write_failures -= 1;
                    return Err(GattError::Write {
                        channel,
                        reason: "radio busy".to_string(),
                    });
                }
                let part = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                self.received.push((part, bytes[4..].to_vec()));
                if self.silent || self.silent_after == Some(part) {
                    self.silent = true;
                    return Ok(Vec::new());
                }
                let next = part + 1;
                if let Some((fail_part, code)) = self.fail_at
                    && fail_part == next
                {
                    return Ok(vec![vec![0x05, code]]);
                }
                let have: usize = self.received.iter().map(|(_, c)| c.len()).sum();
                if have as u32 >= self.expected_len.unwrap_or(0) {
                    Ok(vec![vec![0x05, 0x08, 0, 0, 0, 0]])
                } else {
                    Ok(vec![Self::ack(next)])
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct MockDisplay {
    advertisement: Advertisement,
    state: Arc<Mutex<DisplayState>>,
}

impl MockDisplay {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            advertisement: Advertisement {
                address,
                name: Some("Price Tag".to_string()),
                rssi: Some(-60),
            },
            state: Arc::new(Mutex::new(DisplayState {
                requested_size: 184,
                connect_failures: 0,
                connect_calls: 0,
                connected: false,
                tx: None,
                expected_len: None,
                received: Vec::new(),
                commands: Vec::new(),
                fail_at: None,
                silent_after: None,
                silent: false,
                write_failures: 0,
                stay_connected: false,
                stall_subscribe: false,
                links: Vec::new(),
            })),
        }
    }

    fn with(self, f: impl FnOnce(&mut DisplayState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn failing_connects(self, n: u32) -> Self {
        self.with(|s| s.connect_failures = n)
    }

    pub fn requesting_size(self, size: u16) -> Self {
        self.with(|s| s.requested_size = size)
    }

    /// Report `code` instead of acknowledging `part`.
    pub fn failing_at(self, part: u32, code: u8) -> Self {
        self.with(|s| s.fail_at = Some((part, code)))
    }

    /// Stop answering once `part` has been received.
    pub fn silent_after(self, part: u32) -> Self {
        self.with(|s| s.silent_after = Some(part))
    }

    /// Reject the next `n` image writes.
    pub fn failing_writes(self, n: u32) -> Self {
        self.with(|s| s.write_failures = n)
    }

    /// Keep the link up after completing instead of dropping it.
    pub fn staying_connected(self) -> Self {
        self.with(|s| s.stay_connected = true)
    }

    /// Accept connections but never finish subscribing.
    pub fn stalling_subscribe(self) -> Self {
        self.with(|s| s.stall_subscribe = true)
    }

    pub fn is_link_up(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().unwrap().connect_calls
    }

    pub fn received(&self) -> Vec<(u32, Vec<u8>)> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Start and end of every link, in order.
    pub fn links(&self) -> Vec<(Instant, Option<Instant>)> {
        self.state.lock().unwrap().links.clone()
    }
}

#[async_trait]
impl BlePeripheral for MockDisplay {
    fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    async fn connect(&self) -> Result<(), GattError> {
        let mut state = self.state.lock().unwrap();
        state.connect_calls += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(GattError::Connect("connection refused".to_string()));
        }
        state.connected = true;
        state.silent = false;
        state.links.push((Instant::now(), None));
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>, GattError> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.connected {
                return Err(GattError::Subscribe("not connected".to_string()));
            }
            if !state.stall_subscribe {
                let (tx, rx) = mpsc::channel(256);
                state.tx = Some(tx);
                return Ok(rx);
            }
        }
        std::future::pending().await
    }

    async fn write(&self, channel: Channel, data: &[u8]) -> Result<(), GattError> {
        let (tx, notifications) = {
            let mut state = self.state.lock().unwrap();
            let notifications = state.on_write(channel, data)?;
            let tx = state.tx.clone();
            let completed = notifications.last().is_some_and(|n| n.starts_with(&[0x05, 0x08]));
            if completed && !state.stay_connected {
                state.drop_link();
            }
            (tx, notifications)
        };
        if let Some(tx) = tx {
            for notification in notifications {
                let _ = tx.try_send(notification);
            }
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn disconnect(&self) -> Result<(), GattError> {
        self.state.lock().unwrap().drop_link();
        Ok(())
    }
}
