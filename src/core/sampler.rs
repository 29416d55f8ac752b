//! Tile sampling.
//!
//! The face is assumed to fill the frame. It is split into a 3x3 grid by
//! proportional geometry, each cell is shrunk by the configured inset to
//! stay clear of sticker gaps and border glare, and the remaining window is
//! reduced to its per-channel median.

use crate::config::SamplingConfig;
use crate::core::preprocess::RawImage;
use crate::domain::model::{LabColor, TilePosition, TileSample};
use crate::utils::error::{CubeError, Result};

/// Pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Window {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }
}

/// Inner sampling window of one tile.
pub fn sampling_window(width: u32, height: u32, position: TilePosition, inset: f32) -> Window {
    let (col, row) = (position.col(), position.row());
    let cell_x0 = col * width / 3;
    let cell_x1 = (col + 1) * width / 3;
    let cell_y0 = row * height / 3;
    let cell_y1 = (row + 1) * height / 3;

    let inset_x = ((cell_x1 - cell_x0) as f32 * inset).floor() as u32;
    let inset_y = ((cell_y1 - cell_y0) as f32 * inset).floor() as u32;

    Window {
        x0: cell_x0 + inset_x,
        y0: cell_y0 + inset_y,
        x1: cell_x1.saturating_sub(inset_x),
        y1: cell_y1.saturating_sub(inset_y),
    }
}

/// One sample per position, in `TilePosition::ALL` order.
pub fn sample_tiles(image: &RawImage, config: &SamplingConfig) -> Result<[TileSample; 9]> {
    let mut samples = Vec::with_capacity(9);
    for position in TilePosition::ALL {
        samples.push(sample_tile(image, position, config)?);
    }

    samples.try_into().map_err(|_| CubeError::Internal {
        message: "sampler produced a partial grid".to_string(),
    })
}

pub fn sample_tile(
    image: &RawImage,
    position: TilePosition,
    config: &SamplingConfig,
) -> Result<TileSample> {
    let window = sampling_window(image.width(), image.height(), position, config.inset);
    if window.width() == 0 || window.height() == 0 {
        return Err(CubeError::Sampling {
            tile: position,
            reason: format!(
                "degenerate sampling window {}x{} at ({}, {})",
                window.width(),
                window.height(),
                window.x0,
                window.y0
            ),
        });
    }

    let mut histograms = [[0u32; 256]; 3];
    for y in window.y0..window.y1 {
        for x in window.x0..window.x1 {
            let px = image.pixel(x, y);
            for channel in 0..3 {
                histograms[channel][px[channel] as usize] += 1;
            }
        }
    }

    let total = window.area();
    let rgb = [
        histogram_median(&histograms[0], total),
        histogram_median(&histograms[1], total),
        histogram_median(&histograms[2], total),
    ];

    let tolerance = config.uniformity_tolerance;
    let mut uniform = 0u64;
    for y in window.y0..window.y1 {
        for x in window.x0..window.x1 {
            let px = image.pixel(x, y);
            if (0..3).all(|c| px[c].abs_diff(rgb[c]) <= tolerance) {
                uniform += 1;
            }
        }
    }

    Ok(TileSample {
        position,
        rgb,
        lab: LabColor::from_rgb(rgb),
        sample_confidence: (uniform as f64 / total as f64) as f32,
    })
}

/// Lower median of a 256-bin histogram holding `total` values.
fn histogram_median(histogram: &[u32; 256], total: u64) -> u8 {
    let target = total.div_ceil(2);
    let mut seen = 0u64;
    for (value, count) in histogram.iter().enumerate() {
        seen += *count as u64;
        if seen >= target {
            return value as u8;
        }
    }
    u8::MAX
}
