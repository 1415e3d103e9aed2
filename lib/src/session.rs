//! The upload state machine.
//!
//! A [`TransferSession`] owns one upload. It performs no I/O: the caller feeds
//! it notification bytes from the command channel and writes out whatever
//! [`Outbound`] frames it returns. Chunks are only ever released in response
//! to an acknowledgment from the display, so the session never writes ahead
//! of the display's flow control.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;

use crate::chunk::ChunkPlan;
use crate::encoder::EncodedPayload;
use crate::protocol::{self, Channel, Command, Notification, ProtocolError, TransferStatus};

/// Part size used if the display accepts the size announcement without
/// ever requesting a part size.
pub const DEFAULT_PART_SIZE: usize = 180;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already started (state: {0})")]
    AlreadyStarted(TransferState),
    #[error("payload of {0} bytes does not fit the size announcement")]
    PayloadTooLarge(usize),
}

/// Why a session ended in [`TransferState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The display reported this status byte.
    Display(u8),
    Protocol(ProtocolError),
    Transport(String),
    /// No notification arrived in time while in the given state.
    Timeout(&'static str),
    /// The notification stream ended before the upload finished.
    Disconnected,
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Display(code) => write!(f, "display reported status {code:#04x}"),
            FailureReason::Protocol(e) => write!(f, "protocol error: {e}"),
            FailureReason::Transport(e) => write!(f, "write failed: {e}"),
            FailureReason::Timeout(stage) => write!(f, "timed out during {stage}"),
            FailureReason::Disconnected => write!(f, "display disconnected"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    SizeNegotiation,
    Uploading,
    /// Every part has been acknowledged, waiting for the completion status.
    AwaitingFinalAck,
    Complete,
    Failed(FailureReason),
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::SizeNegotiation => "size negotiation",
            TransferState::Uploading => "uploading",
            TransferState::AwaitingFinalAck => "awaiting final ack",
            TransferState::Complete => "complete",
            TransferState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed(_))
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Failed(reason) => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// A frame the session wants written to the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Command(Command),
    /// An encoded image part, header included.
    ImagePart { part: u32, frame: Vec<u8> },
}

impl Outbound {
    pub fn channel(&self) -> Channel {
        match self {
            Outbound::Command(_) => Channel::Command,
            Outbound::ImagePart { .. } => Channel::Image,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Outbound::Command(cmd) => cmd.encode(),
            Outbound::ImagePart { frame, .. } => frame.clone(),
        }
    }
}

pub struct TransferSession {
    payload: EncodedPayload,
    state: TransferState,
    part_size: Option<usize>,
    parts_sent: usize,
}

impl TransferSession {
    pub fn new(payload: EncodedPayload) -> Self {
        Self {
            payload,
            state: TransferState::Idle,
            part_size: None,
            parts_sent: 0,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Negotiated payload bytes per part, once known.
    pub fn part_size(&self) -> Option<usize> {
        self.part_size
    }

    /// Number of image parts handed out so far, retransmissions included.
    pub fn parts_sent(&self) -> usize {
        self.parts_sent
    }

    pub fn plan(&self) -> Option<ChunkPlan> {
        self.part_size
            .map(|size| ChunkPlan::new(self.payload.len(), size))
    }

    /// Start the upload: announces it and declares the payload length.
    pub fn begin_upload(&mut self) -> Result<Vec<Outbound>, SessionError> {
        if self.state != TransferState::Idle {
            return Err(SessionError::AlreadyStarted(self.state.clone()));
        }
        let len = u32::try_from(self.payload.len())
            .map_err(|_| SessionError::PayloadTooLarge(self.payload.len()))?;
        debug!("starting upload of {len} bytes");
        self.state = TransferState::SizeNegotiation;
        Ok(vec![
            Outbound::Command(Command::StartUpload),
            Outbound::Command(Command::AnnounceSize(len)),
        ])
    }

    /// Move to [`TransferState::Failed`] unless already finished.
    pub fn fail(&mut self, reason: FailureReason) {
        if self.is_finished() {
            return;
        }
        warn!("upload failed in state {}: {reason}", self.state.name());
        self.state = TransferState::Failed(reason);
    }

    /// Feed one notification received on the command channel.
    pub fn handle_notification(&mut self, data: &[u8]) -> Vec<Outbound> {
        if self.is_finished() {
            debug!("ignoring notification after session ended: {data:02x?}");
            return Vec::new();
        }

        let notification = match Notification::decode(data) {
            Ok(n) => n,
            Err(e) => {
                self.fail(FailureReason::Protocol(e));
                return Vec::new();
            }
        };
        debug!("got notification {notification:?} in state {}", self.state);

        let state = self.state.clone();
        match (notification, &state) {
            (Notification::PartSizeRequest { requested_size }, TransferState::SizeNegotiation) => {
                let size = Notification::negotiated_part_size(requested_size);
                debug!("display requested part size: {size}");
                self.part_size = Some(size);
                Vec::new()
            }
            (Notification::SizeAccepted, TransferState::SizeNegotiation) => {
                if self.part_size.is_none() {
                    warn!("display did not request a part size, using {DEFAULT_PART_SIZE}");
                    self.part_size = Some(DEFAULT_PART_SIZE);
                }
                self.state = TransferState::Uploading;
                vec![Outbound::Command(Command::Acknowledge)]
            }
            (Notification::TransferStatus(TransferStatus::Error(code)), _) => {
                self.fail(FailureReason::Display(code));
                Vec::new()
            }
            (
                Notification::TransferStatus(TransferStatus::Complete),
                TransferState::Uploading | TransferState::AwaitingFinalAck,
            ) => {
                info!("upload complete after {} parts", self.parts_sent);
                self.state = TransferState::Complete;
                Vec::new()
            }
            (
                Notification::TransferStatus(TransferStatus::PartAcknowledged(part)),
                TransferState::Uploading | TransferState::AwaitingFinalAck,
            ) => self.next_part(part),
            (Notification::Unknown(opcode), _) => {
                debug!("ignoring unknown notification {opcode:#04x}");
                Vec::new()
            }
            (notification, state) => {
                warn!("ignoring unexpected {notification:?} in state {state}");
                Vec::new()
            }
        }
    }

    fn next_part(&mut self, part: u32) -> Vec<Outbound> {
        let Some(plan) = self.plan() else {
            return Vec::new();
        };
        match plan.range(part) {
            Some(range) => {
                self.state = TransferState::Uploading;
                self.parts_sent += 1;
                if self.parts_sent % 20 == 0 {
                    debug!(
                        "sent {} of {} parts",
                        self.parts_sent,
                        plan.part_count()
                    );
                }
                let frame = protocol::encode_image_part(part, &self.payload.as_bytes()[range]);
                vec![Outbound::ImagePart { part, frame }]
            }
            None => {
                debug!("all parts delivered, waiting for completion");
                self.state = TransferState::AwaitingFinalAck;
                Vec::new()
            }
        }
    }
}
