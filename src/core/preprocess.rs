//! Image decoding and normalization.
//!
//! Raw upload bytes in, an oriented RGB pixel grid within the configured
//! geometry bounds out. Oversized photos are downscaled to the working
//! resolution so sampling cost does not depend on the camera.

use crate::config::ImageConfig;
use crate::utils::error::{CubeError, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader, RgbImage};
use std::io::Cursor;

/// Decoded, oriented 8-bit RGB pixels. Request-scoped and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pixels: RgbImage,
}

impl RawImage {
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Interleaved R, G, B.
    pub fn channels(&self) -> u8 {
        3
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.pixels.get_pixel(x, y).0
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }
}

pub fn preprocess(bytes: &[u8], config: &ImageConfig) -> Result<RawImage> {
    if bytes.is_empty() {
        return Err(CubeError::ImageDecode {
            reason: "empty input".to_string(),
        });
    }
    if bytes.len() > config.max_bytes {
        return Err(CubeError::PayloadTooLarge {
            bytes: bytes.len(),
            max_bytes: config.max_bytes,
        });
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| CubeError::ImageDecode {
            reason: e.to_string(),
        })?;
    let mut decoder = reader.into_decoder().map_err(decode_error)?;

    // Bounds are symmetric in width and height, so checking before the
    // orientation swap is equivalent and avoids decoding huge images.
    let (width, height) = decoder.dimensions();
    check_bounds(width, height, config)?;

    let orientation = decoder.orientation().map_err(decode_error)?;
    let mut image = DynamicImage::from_decoder(decoder).map_err(decode_error)?;
    image.apply_orientation(orientation);

    let rgb = downscale(image.to_rgb8(), config);
    tracing::debug!(
        "Preprocessed {}x{} image to {}x{}",
        width,
        height,
        rgb.width(),
        rgb.height()
    );

    Ok(RawImage::from_rgb(rgb))
}

fn decode_error(e: image::ImageError) -> CubeError {
    CubeError::ImageDecode {
        reason: e.to_string(),
    }
}

fn check_bounds(width: u32, height: u32, config: &ImageConfig) -> Result<()> {
    if width < config.min_dimension || height < config.min_dimension {
        return Err(CubeError::ImageTooSmall {
            width,
            height,
            min: config.min_dimension,
        });
    }
    if width > config.max_dimension || height > config.max_dimension {
        return Err(CubeError::ImageTooLarge {
            width,
            height,
            max: config.max_dimension,
        });
    }
    Ok(())
}

fn downscale(rgb: RgbImage, config: &ImageConfig) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let long_side = width.max(height);
    if long_side <= config.working_resolution {
        return rgb;
    }

    let short_side = width.min(height) as f64;
    let mut scale = config.working_resolution as f64 / long_side as f64;
    // never shrink the short side under the minimum we validated against
    let floor = config.min_dimension as f64 / short_side;
    if short_side * scale < config.min_dimension as f64 {
        scale = floor.min(1.0);
    }

    let new_width = ((width as f64 * scale).round() as u32).max(1);
    let new_height = ((height as f64 * scale).round() as u32).max(1);
    image::imageops::resize(&rgb, new_width, new_height, FilterType::Triangle)
}
