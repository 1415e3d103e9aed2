use std::path::PathBuf;

use pricetag::DeviceAddress;
use pricetag::encoder::ImageError;
use pricetag::protocol::ProtocolError;
use pricetag::session::{FailureReason, SessionError};
use thiserror::Error;

use crate::gatt::GattError;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("device {address} not found after {attempts} scan attempts")]
    DeviceNotFound { address: DeviceAddress, attempts: u32 },
    #[error("could not connect to {address} after {attempts} attempts: {reason}")]
    ConnectionFailed {
        address: DeviceAddress,
        attempts: u32,
        reason: String,
    },
    #[error("display reported error status {code:#04x}")]
    DisplayError { code: u8 },
    #[error("timed out waiting for the display during {stage}")]
    Timeout { stage: &'static str },
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("malformed notification from display: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("upload cancelled")]
    Cancelled,
    #[error(transparent)]
    Bluetooth(#[from] GattError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("upload queue is not running")]
    QueueClosed,
}

impl UploadError {
    /// Failures of the link rather than of the display or the input, which
    /// are worth another full connect-and-upload cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UploadError::Timeout { .. } | UploadError::TransportError(_)
        )
    }
}

impl From<FailureReason> for UploadError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::Display(code) => UploadError::DisplayError { code },
            FailureReason::Protocol(e) => UploadError::Protocol(e),
            FailureReason::Transport(e) => UploadError::TransportError(e),
            FailureReason::Timeout(stage) => UploadError::Timeout { stage },
            FailureReason::Disconnected => {
                UploadError::TransportError("display disconnected mid-transfer".to_string())
            }
            FailureReason::Cancelled => UploadError::Cancelled,
        }
    }
}

impl From<ImageError> for UploadError {
    fn from(err: ImageError) -> Self {
        UploadError::InvalidImage(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
