pub mod ble;
pub mod config;
pub mod connection;
pub mod error;
pub mod gatt;
pub mod transfer;
pub mod upload;

#[cfg(test)]
mod mock;

pub use error::UploadError;
pub use upload::{ImageSource, UploadCoordinator, UploadHandle, UploadReport, run_upload_worker};
