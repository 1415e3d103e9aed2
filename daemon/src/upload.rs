//! One upload end to end: image in, pixels on the panel, link torn down.
//!
//! [`UploadCoordinator`] does a single upload. [`run_upload_worker`] puts a
//! coordinator behind a queue so that callers can submit from anywhere while
//! only one display is ever being talked to at a time.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use pricetag::encoder::{EncodedPayload, RasterImage, encode};
use pricetag::session::TransferSession;
use pricetag::{DeviceAddress, ScreenType};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::{Connection, ConnectionManager, LinkSettings};
use crate::error::UploadError;
use crate::gatt::{BleCentral, BlePeripheral};
use crate::transfer::run_session;

const QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub link: LinkSettings,
    pub screen: ScreenType,
    pub notification_timeout: Duration,
    /// How long a completed display gets to drop the link by itself.
    pub disconnect_grace: Duration,
    /// Full connect-and-upload cycles to try when the link fails or goes
    /// quiet mid-transfer. Defaults to the connection budget.
    pub transfer_attempts: u32,
    pub transfer_backoff: Duration,
}

impl Default for UploadSettings {
    fn default() -> Self {
        let link = LinkSettings::default();
        Self {
            link,
            screen: ScreenType::default(),
            notification_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(2),
            transfer_attempts: link.connect.max_attempts,
            transfer_backoff: Duration::from_secs(2),
        }
    }
}

pub enum ImageSource {
    Path(PathBuf),
    /// An encoded image file (PNG, JPEG, ...) already in memory.
    Bytes(Vec<u8>),
    Raster(RasterImage),
}

impl ImageSource {
    async fn load(self) -> Result<RasterImage, UploadError> {
        match self {
            ImageSource::Path(path) => {
                let image = tokio::task::spawn_blocking(move || RasterImage::load(&path))
                    .await
                    .map_err(|e| UploadError::InvalidImage(format!("image loader failed: {e}")))??;
                Ok(image)
            }
            ImageSource::Bytes(bytes) => Ok(RasterImage::decode(&bytes)?),
            ImageSource::Raster(image) => Ok(image),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub address: DeviceAddress,
    pub payload_len: usize,
    pub part_size: usize,
    pub parts_sent: usize,
    /// Connect-and-upload cycles it took, the successful one included.
    pub attempts: u32,
}

pub struct UploadCoordinator<C> {
    connections: ConnectionManager<C>,
    settings: UploadSettings,
}

impl<C: BleCentral> UploadCoordinator<C> {
    pub fn new(central: C, settings: UploadSettings) -> Self {
        Self {
            connections: ConnectionManager::new(central, settings.link),
            settings,
        }
    }

    /// Load, encode and upload `source` to the display at `address`.
    pub async fn submit(
        &self,
        source: ImageSource,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        let image = source.load().await?;
        self.upload(image, address, cancel).await
    }

    pub async fn upload(
        &self,
        image: RasterImage,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        let image = image.fit_to_screen(self.settings.screen);
        let payload = encode(&image);
        info!(
            "encoded {}x{} image into {} bytes for {address}",
            image.width(),
            image.height(),
            payload.len()
        );

        let max_attempts = self.settings.transfer_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.upload_once(&payload, address, cancel).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    return Ok(report);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.transfer_backoff;
                    warn!(
                        "upload to {address} failed (attempt {attempt}/{max_attempts}): {e}, retrying in {delay:?}"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload_once(
        &self,
        payload: &EncodedPayload,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        let Connection {
            peripheral,
            mut notifications,
        } = self.connections.connect(address, cancel).await?;

        let mut session = TransferSession::new(payload.clone());
        let result = run_session(
            &mut session,
            &peripheral,
            &mut notifications,
            self.settings.notification_timeout,
            cancel,
        )
        .await;

        match result {
            Ok(()) => {
                info!("image sent to {address}");
                self.wait_for_release(&peripheral, cancel).await;
                Ok(UploadReport {
                    address,
                    payload_len: session.payload_len(),
                    part_size: session.part_size().unwrap_or_default(),
                    parts_sent: session.parts_sent(),
                    attempts: 1,
                })
            }
            Err(e) => {
                disconnect(&peripheral).await;
                Err(e)
            }
        }
    }

    /// The display drops the link on its own once it starts refreshing.
    /// Only disconnect from our side if it hasn't within the grace period.
    async fn wait_for_release(&self, peripheral: &C::Peripheral, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {},
            _ = tokio::time::sleep(self.settings.disconnect_grace) => {},
        }
        if peripheral.is_connected().await {
            debug!(
                "display still connected after {:?}, disconnecting",
                self.settings.disconnect_grace
            );
            disconnect(peripheral).await;
        }
    }
}

async fn disconnect<P: BlePeripheral>(peripheral: &P) {
    if let Err(e) = peripheral.disconnect().await {
        warn!(
            "failed to disconnect from {}: {e}",
            peripheral.advertisement().address
        );
    }
}

struct UploadRequest {
    source: ImageSource,
    address: DeviceAddress,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<UploadReport, UploadError>>,
}

/// Submits uploads to a running worker. Cheap to clone.
#[derive(Clone)]
pub struct UploadHandle {
    tx: mpsc::Sender<UploadRequest>,
}

impl UploadHandle {
    /// Queue an upload and wait for its outcome.
    ///
    /// Cancelling `cancel`, or dropping the returned future, withdraws the
    /// request: it is skipped if still queued and aborted if already running.
    pub async fn submit(
        &self,
        source: ImageSource,
        address: DeviceAddress,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        let cancel = cancel.child_token();
        let _abandon = cancel.clone().drop_guard();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(UploadRequest {
                source,
                address,
                cancel,
                reply,
            })
            .await
            .map_err(|_| UploadError::QueueClosed)?;
        rx.await.map_err(|_| UploadError::QueueClosed)?
    }
}

/// Start a worker that runs queued uploads one after another until
/// `shutdown_token` is cancelled or every handle is dropped. Cancelling also
/// aborts the upload in flight. A single request can be withdrawn through the
/// token passed to [`UploadHandle::submit`] without stopping the worker.
pub fn run_upload_worker<C>(
    task_tracker: &TaskTracker,
    coordinator: UploadCoordinator<C>,
    shutdown_token: CancellationToken,
) -> UploadHandle
where
    C: BleCentral + 'static,
{
    let (tx, mut rx) = mpsc::channel::<UploadRequest>(QUEUE_DEPTH);
    task_tracker.spawn(async move {
        info!("upload worker started");
        loop {
            let request = tokio::select! {
                _ = shutdown_token.cancelled() => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let address = request.address;
            if request.cancel.is_cancelled() {
                debug!("upload to {address} was withdrawn before it started");
                let _ = request.reply.send(Err(UploadError::Cancelled));
                continue;
            }

            info!("starting upload to {address}");
            let cancel = shutdown_token.child_token();
            let upload = coordinator.submit(request.source, address, &cancel);
            tokio::pin!(upload);
            let result = tokio::select! {
                result = &mut upload => result,
                _ = request.cancel.cancelled() => {
                    info!("upload to {address} withdrawn, aborting");
                    cancel.cancel();
                    upload.await
                }
            };
            match &result {
                Ok(report) => info!(
                    "upload to {address} finished: {} bytes in {} parts of {}",
                    report.payload_len, report.parts_sent, report.part_size
                ),
                Err(e) => error!("upload to {address} failed: {e}"),
            }
            if request.reply.send(result).is_err() {
                debug!("submitter for {address} went away before the upload finished");
            }
        }
        info!("upload worker stopped");
    });
    UploadHandle { tx }
}
