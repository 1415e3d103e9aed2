//! Conversion of raster images into the panel's two-plane bitmap.
//!
//! The panel takes two 1-bit planes back to back: a black/white plane where a
//! set bit is a light pixel, followed by a red plane where a set bit is a red
//! pixel. Pixels are packed most-significant-bit first in row-major order.
//!
//! Images that don't match the canvas are resized with a triangle (bilinear)
//! filter before encoding; see [`RasterImage::fit_to`].

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use log::debug;
use thiserror::Error;

use crate::ScreenType;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image file not found: {0}")]
    Missing(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("pixel buffer of {len} bytes does not match {width}x{height} RGB")]
    BufferSize { width: u32, height: u32, len: usize },
    #[error("image has zero width or height")]
    Empty,
}

/// A decoded RGB image. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterImage(RgbImage);

impl RasterImage {
    /// Wrap a packed RGB888 buffer.
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Result<Self, ImageError> {
        let len = rgb.len();
        if width == 0 || height == 0 {
            return Err(ImageError::Empty);
        }
        if len != width as usize * height as usize * 3 {
            return Err(ImageError::BufferSize { width, height, len });
        }
        RgbImage::from_raw(width, height, rgb)
            .map(Self)
            .ok_or(ImageError::BufferSize { width, height, len })
    }

    /// An image where every pixel has the same color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn from_dynamic(img: DynamicImage) -> Self {
        Self(img.to_rgb8())
    }

    /// Decode an in-memory image (PNG, JPEG, GIF or BMP).
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let img = image::load_from_memory(bytes)?;
        Self::checked(img)
    }

    /// Load and decode an image file.
    pub fn load(path: &Path) -> Result<Self, ImageError> {
        debug!("loading image: {}", path.display());
        if !path.is_file() {
            return Err(ImageError::Missing(path.display().to_string()));
        }
        let img = image::open(path)?;
        Self::checked(img)
    }

    fn checked(img: DynamicImage) -> Result<Self, ImageError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(ImageError::Empty);
        }
        Ok(Self::from_dynamic(img))
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Packed RGB888 pixel data in row-major order.
    pub fn as_rgb(&self) -> &[u8] {
        self.0.as_raw()
    }

    /// Resize to exactly `width`x`height` if the image doesn't already have
    /// those dimensions.
    pub fn fit_to(self, width: u32, height: u32) -> Self {
        if self.width() == width && self.height() == height {
            debug!("image already matches target dimensions");
            return self;
        }
        debug!(
            "scaling image from {}x{} to {width}x{height}",
            self.width(),
            self.height()
        );
        Self(imageops::resize(&self.0, width, height, FilterType::Triangle))
    }

    /// Resize to the canvas of the given panel.
    pub fn fit_to_screen(self, screen: ScreenType) -> Self {
        let (width, height) = screen.dimensions();
        self.fit_to(width, height)
    }
}

/// The encoded black/white and red planes, ready to upload.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    bytes: Vec<u8>,
    plane_len: usize,
}

impl EncodedPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bw_plane(&self) -> &[u8] {
        &self.bytes[..self.plane_len]
    }

    pub fn red_plane(&self) -> &[u8] {
        &self.bytes[self.plane_len..]
    }
}

impl std::fmt::Debug for EncodedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedPayload")
            .field("len", &self.bytes.len())
            .field("plane_len", &self.plane_len)
            .finish()
    }
}

fn is_light(r: u8, g: u8, b: u8) -> bool {
    let luminance = 0.2126 * r as f64 + 0.7152 * g as f64 + 0.0722 * b as f64;
    luminance > 128.0
}

// Firmware expects exactly this mapping, don't tune it.
fn is_red(r: u8, g: u8) -> bool {
    r > 170 && g < 170
}

/// Encode an image into the panel's two-plane format.
///
/// The output is always `2 * ceil(width * height / 8)` bytes.
pub fn encode(image: &RasterImage) -> EncodedPayload {
    let pixel_count = image.width() as usize * image.height() as usize;
    let plane_len = pixel_count.div_ceil(8);
    let mut bw = Vec::with_capacity(plane_len);
    let mut red = Vec::with_capacity(plane_len);

    let mut bit: i8 = 7;
    let mut bw_byte = 0u8;
    let mut red_byte = 0u8;
    for px in image.as_rgb().chunks_exact(3) {
        let (r, g, b) = (px[0], px[1], px[2]);
        if is_light(r, g, b) {
            bw_byte |= 1 << bit;
        }
        if is_red(r, g) {
            red_byte |= 1 << bit;
        }
        bit -= 1;
        if bit < 0 {
            bw.push(bw_byte);
            red.push(red_byte);
            bw_byte = 0;
            red_byte = 0;
            bit = 7;
        }
    }
    if bit != 7 {
        bw.push(bw_byte);
        red.push(red_byte);
    }

    bw.extend_from_slice(&red);
    EncodedPayload {
        bytes: bw,
        plane_len,
    }
}
