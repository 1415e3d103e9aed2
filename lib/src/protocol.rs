//! Frames exchanged with the display over its two GATT characteristics.
//!
//! The host writes commands to the command characteristic and receives
//! notifications on it. Image data goes to the image characteristic as
//! parts, each prefixed with its little-endian part number.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use uuid::Uuid;

/// Primary service advertised by the display.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fef0_0000_1000_8000_00805f9b34fb);
/// Command channel: host writes, display notifies.
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fef1_0000_1000_8000_00805f9b34fb);
/// Image channel: host writes only.
pub const IMAGE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000fef2_0000_1000_8000_00805f9b34fb);

/// Bytes of each image part taken up by the part number header.
pub const PART_HEADER_LEN: usize = 4;

const OP_START_UPLOAD: u8 = 0x01;
const OP_ANNOUNCE_SIZE: u8 = 0x02;
const OP_ACKNOWLEDGE: u8 = 0x03;

const NOTIFY_PART_SIZE: u8 = 0x01;
const NOTIFY_SIZE_ACCEPTED: u8 = 0x02;
const NOTIFY_TRANSFER_STATUS: u8 = 0x05;

const STATUS_PART_ACK: u8 = 0x00;
const STATUS_COMPLETE: u8 = 0x08;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty notification")]
    Empty,
    #[error("truncated notification {opcode:#04x}: need {expected} bytes, got {actual}")]
    Truncated {
        opcode: u8,
        expected: usize,
        actual: usize,
    },
    #[error("display requested unusable part size {0}")]
    InvalidPartSize(u16),
}

/// Which characteristic a write is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Command,
    Image,
}

impl Channel {
    pub fn uuid(&self) -> Uuid {
        match self {
            Channel::Command => COMMAND_CHAR_UUID,
            Channel::Image => IMAGE_CHAR_UUID,
        }
    }
}

/// Commands written by the host on the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartUpload,
    /// Total length of the encoded payload.
    AnnounceSize(u32),
    Acknowledge,
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::StartUpload => vec![OP_START_UPLOAD],
            Command::AnnounceSize(len) => {
                let mut buf = BytesMut::with_capacity(8);
                buf.put_u8(OP_ANNOUNCE_SIZE);
                buf.put_u32_le(*len);
                // reserved
                buf.put_bytes(0, 3);
                buf.to_vec()
            }
            Command::Acknowledge => vec![OP_ACKNOWLEDGE],
        }
    }
}

/// Build an image channel write: part number header followed by the chunk.
pub fn encode_image_part(part: u32, chunk: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(PART_HEADER_LEN + chunk.len());
    buf.put_u32_le(part);
    buf.put_slice(chunk);
    buf.to_vec()
}

/// Status byte carried by a transfer status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The display wants the part following this acknowledgment.
    PartAcknowledged(u32),
    Complete,
    /// Any other status byte: the display gave up.
    Error(u8),
}

/// Notifications sent by the display on the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The display's requested part size, header included.
    PartSizeRequest { requested_size: u16 },
    SizeAccepted,
    TransferStatus(TransferStatus),
    /// A first byte we don't know how to handle.
    Unknown(u8),
}

impl Notification {
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        if !buf.has_remaining() {
            return Err(ProtocolError::Empty);
        }
        let opcode = buf.get_u8();
        let need = |expected: usize| {
            if data.len() < expected {
                Err(ProtocolError::Truncated {
                    opcode,
                    expected,
                    actual: data.len(),
                })
            } else {
                Ok(())
            }
        };

        match opcode {
            NOTIFY_PART_SIZE => {
                need(3)?;
                let requested_size = buf.get_u16_le();
                if (requested_size as usize) <= PART_HEADER_LEN {
                    return Err(ProtocolError::InvalidPartSize(requested_size));
                }
                Ok(Notification::PartSizeRequest { requested_size })
            }
            NOTIFY_SIZE_ACCEPTED => Ok(Notification::SizeAccepted),
            NOTIFY_TRANSFER_STATUS => {
                need(2)?;
                let status = match buf.get_u8() {
                    STATUS_COMPLETE => TransferStatus::Complete,
                    STATUS_PART_ACK => {
                        need(6)?;
                        TransferStatus::PartAcknowledged(buf.get_u32_le())
                    }
                    code => TransferStatus::Error(code),
                };
                Ok(Notification::TransferStatus(status))
            }
            other => Ok(Notification::Unknown(other)),
        }
    }

    /// Payload bytes per part for a part size request, i.e. without the
    /// part number header.
    pub fn negotiated_part_size(requested_size: u16) -> usize {
        (requested_size as usize).saturating_sub(PART_HEADER_LEN)
    }
}
