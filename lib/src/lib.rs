use serde::{Deserialize, Serialize};

/// Initialize logging with the given default level, keeping the BLE stack's
/// per-advertisement chatter out of the output. Respects `RUST_LOG` overrides.
pub fn init_logging(default_level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(default_level)
        // btleplug logs every advertisement it sees at debug level
        .filter_module("btleplug", log::LevelFilter::Warn)
        .filter_module("bluez_async", log::LevelFilter::Warn)
        .parse_default_env()
        .init();
}

pub mod address;
pub mod chunk;
pub mod encoder;
pub mod protocol;
pub mod retry;
pub mod session;

pub use address::DeviceAddress;

/// Width of the display panel in pixels.
pub const CANVAS_WIDTH: u32 = 400;
/// Height of the display panel in pixels.
pub const CANVAS_HEIGHT: u32 = 300;

/// The panel models this crate knows how to drive.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub enum ScreenType {
    /// 4.2" black/white/red panel.
    #[default]
    #[serde(rename = "4,2 BWR", alias = "bwr42")]
    Bwr42,
}

impl ScreenType {
    /// Canvas size as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ScreenType::Bwr42 => (CANVAS_WIDTH, CANVAS_HEIGHT),
        }
    }
}
