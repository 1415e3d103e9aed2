use std::path::{Path, PathBuf};
use std::time::Duration;

use pricetag::retry::RetryPolicy;
use pricetag::{DeviceAddress, ScreenType};
use serde::{Deserialize, Serialize};

use crate::connection::LinkSettings;
use crate::error::ConfigError;
use crate::upload::UploadSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/pricetag/config.toml";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub device_address: Option<DeviceAddress>,
    pub screen_type: ScreenType,
    pub image_dir: PathBuf,
    pub image_filename: Option<String>,
    pub debug_mode: bool,
    pub adapter_index: usize,
    pub scan: ScanConfig,
    pub connect: ConnectConfig,
    pub notification_timeout_secs: u64,
    pub disconnect_grace_secs: u64,
    /// Connect-and-upload cycles after a mid-transfer timeout or link loss.
    /// Unset means the same budget as `connect.max_attempts`.
    pub transfer_attempts: Option<u32>,
    pub transfer_backoff_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_address: None,
            screen_type: ScreenType::default(),
            image_dir: "/config/images".into(),
            image_filename: None,
            debug_mode: false,
            adapter_index: 0,
            scan: ScanConfig::default(),
            connect: ConnectConfig::default(),
            notification_timeout_secs: 30,
            disconnect_grace_secs: 2,
            transfer_attempts: None,
            transfer_backoff_secs: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_attempts: u32,
    pub scan_duration_secs: u64,
    pub attempt_timeout_secs: u64,
    pub backoff_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            scan_duration_secs: 5,
            attempt_timeout_secs: 8,
            backoff_secs: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub backoff_secs: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            attempt_timeout_secs: 15,
            backoff_secs: 2,
        }
    }
}

impl Config {
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            scan: RetryPolicy::fixed(
                self.scan.max_attempts,
                Duration::from_secs(self.scan.attempt_timeout_secs),
                Duration::from_secs(self.scan.backoff_secs),
            ),
            scan_duration: Duration::from_secs(self.scan.scan_duration_secs),
            connect: RetryPolicy::fixed(
                self.connect.max_attempts,
                Duration::from_secs(self.connect.attempt_timeout_secs),
                Duration::from_secs(self.connect.backoff_secs),
            ),
        }
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            link: self.link_settings(),
            screen: self.screen_type,
            notification_timeout: Duration::from_secs(self.notification_timeout_secs),
            disconnect_grace: Duration::from_secs(self.disconnect_grace_secs),
            transfer_attempts: self
                .transfer_attempts
                .unwrap_or(self.connect.max_attempts),
            transfer_backoff: Duration::from_secs(self.transfer_backoff_secs),
        }
    }

    /// Settings that parse but can't work as intended.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.scan.scan_duration_secs >= self.scan.attempt_timeout_secs {
            warnings.push(format!(
                "scan duration ({}s) is not shorter than the scan attempt timeout ({}s), every scan will time out",
                self.scan.scan_duration_secs, self.scan.attempt_timeout_secs
            ));
        }
        if self.transfer_attempts == Some(0) {
            warnings.push("transfer_attempts = 0, uploads will still be tried once".to_string());
        }
        warnings
    }

    /// The configured image, if a filename is set.
    pub fn image_path(&self) -> Option<PathBuf> {
        self.image_filename
            .as_ref()
            .map(|name| self.image_dir.join(name))
    }
}

pub async fn parse_config<P>(path: P) -> Result<Config, ConfigError>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
    let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    Ok(config)
}

/// Load `path` if given. Without one, fall back to [`DEFAULT_CONFIG_PATH`]
/// and then to defaults if that doesn't exist.
pub async fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => parse_config(path).await,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => parse_config(DEFAULT_CONFIG_PATH).await,
        None => Ok(Config::default()),
    }
}
