//! Drives a [`TransferSession`] over a live link: writes what the session
//! asks for and feeds it notifications until it finishes.

use std::time::Duration;

use log::{debug, warn};
use pricetag::protocol::Channel;
use pricetag::session::{FailureReason, Outbound, TransferSession, TransferState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;
use crate::gatt::BlePeripheral;

enum WriteFailure {
    Cancelled,
    Failed(String),
}

/// Run `session` to completion over `link`.
///
/// Each wait for a notification is bounded by `notification_timeout`, and
/// `cancel` is checked at every wait and write. A failed image part write is
/// retried once before the session is failed.
pub async fn run_session<P: BlePeripheral>(
    session: &mut TransferSession,
    link: &P,
    notifications: &mut mpsc::Receiver<Vec<u8>>,
    notification_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), UploadError> {
    let writes = session.begin_upload()?;
    send_all(session, link, writes, notification_timeout, cancel).await;

    loop {
        match session.state() {
            TransferState::Complete => return Ok(()),
            TransferState::Failed(reason) => return Err(reason.clone().into()),
            _ => {}
        }

        let stage = session.state().name();
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                session.fail(FailureReason::Cancelled);
                continue;
            }
            res = tokio::time::timeout(notification_timeout, notifications.recv()) => res,
        };
        match received {
            Err(_) => session.fail(FailureReason::Timeout(stage)),
            Ok(None) => session.fail(FailureReason::Disconnected),
            Ok(Some(data)) => {
                let writes = session.handle_notification(&data);
                send_all(session, link, writes, notification_timeout, cancel).await;
            }
        }
    }
}

async fn send_all<P: BlePeripheral>(
    session: &mut TransferSession,
    link: &P,
    writes: Vec<Outbound>,
    write_timeout: Duration,
    cancel: &CancellationToken,
) {
    for out in writes {
        if session.is_finished() {
            return;
        }
        let channel = out.channel();
        let bytes = out.to_bytes();
        let mut result = write_once(link, channel, &bytes, write_timeout, cancel).await;
        if let Err(WriteFailure::Failed(e)) = &result
            && let Outbound::ImagePart { part, .. } = &out
        {
            warn!("error sending part {part}: {e}, retrying once");
            result = write_once(link, channel, &bytes, write_timeout, cancel).await;
        }
        match result {
            Ok(()) => {}
            Err(WriteFailure::Cancelled) => session.fail(FailureReason::Cancelled),
            Err(WriteFailure::Failed(e)) => session.fail(FailureReason::Transport(e)),
        }
    }
}

async fn write_once<P: BlePeripheral>(
    link: &P,
    channel: Channel,
    bytes: &[u8],
    write_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), WriteFailure> {
    debug!("writing {} bytes to {channel:?} channel", bytes.len());
    tokio::select! {
        _ = cancel.cancelled() => Err(WriteFailure::Cancelled),
        res = tokio::time::timeout(write_timeout, link.write(channel, bytes)) => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WriteFailure::Failed(e.to_string())),
            Err(_) => Err(WriteFailure::Failed(format!("write timed out after {write_timeout:?}"))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDisplay;
    use pricetag::DeviceAddress;
    use pricetag::encoder::{EncodedPayload, RasterImage, encode};
    use pricetag::{CANVAS_HEIGHT, CANVAS_WIDTH};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn payload() -> EncodedPayload {
        encode(&RasterImage::filled(CANVAS_WIDTH, CANVAS_HEIGHT, [255, 255, 255]))
    }

    async fn linked(display: &MockDisplay) -> mpsc::Receiver<Vec<u8>> {
        display.connect().await.unwrap();
        display.subscribe().await.unwrap()
    }

    fn display() -> MockDisplay {
        MockDisplay::new("AA:BB:CC:DD:EE:FF".parse::<DeviceAddress>().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_upload() {
        let display = display();
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());

        run_session(&mut session, &display, &mut rx, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.state(), &TransferState::Complete);
        let received = display.received();
        assert_eq!(received.len(), 167);
        assert_eq!(received[166].1.len(), 120);
        let rebuilt: Vec<u8> = received.into_iter().flat_map(|(_, c)| c).collect();
        assert_eq!(rebuilt, payload().as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_error() {
        let display = display().failing_at(10, 0x03);
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());

        let result =
            run_session(&mut session, &display, &mut rx, TIMEOUT, &CancellationToken::new()).await;
        assert!(matches!(result, Err(UploadError::DisplayError { code: 0x03 })));
        assert_eq!(display.received().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_display_times_out() {
        let display = display().silent_after(4);
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());

        let result =
            run_session(&mut session, &display, &mut rx, TIMEOUT, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(UploadError::Timeout { stage: "uploading" })
        ));
        assert_eq!(display.received().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_part_write_is_retried_once() {
        let display = display().failing_writes(1);
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());

        run_session(&mut session, &display, &mut rx, TIMEOUT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(display.received().len(), 167);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_write_failure_fails_session() {
        let display = display().failing_writes(2);
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());

        let result =
            run_session(&mut session, &display, &mut rx, TIMEOUT, &CancellationToken::new()).await;
        let Err(UploadError::TransportError(reason)) = &result else {
            panic!("expected transport error, got {result:?}");
        };
        assert!(reason.contains("radio busy"), "{reason}");
        assert!(display.received().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_mid_transfer() {
        let display = display().silent_after(2);
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());
        let link = display.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            link.disconnect().await.unwrap();
        });

        let result =
            run_session(&mut session, &display, &mut rx, TIMEOUT, &CancellationToken::new()).await;
        assert!(matches!(result, Err(UploadError::TransportError(_))));
        assert_eq!(
            session.state(),
            &TransferState::Failed(FailureReason::Disconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let display = display().silent_after(0);
        let mut rx = linked(&display).await;
        let mut session = TransferSession::new(payload());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = run_session(&mut session, &display, &mut rx, TIMEOUT, &cancel).await;
        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(display.received().len(), 1);
    }
}
