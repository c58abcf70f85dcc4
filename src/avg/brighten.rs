//! Final brightening of an averaged frame
//!
//! Averaging lowers noise, which leaves room to lift dark captures. The gain
//! grows with the number of frames averaged and is only used at high ISO,
//! where captures are likely under-exposed.

use crate::dither;
use crate::errors::{try_buffer, Result};
use crate::types::{FrameBuffer, PixelFormat};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// ISO from which brightening is allowed
const BRIGHTEN_MIN_ISO: i32 = 400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvgConfig {
    /// Median brightness aimed for, as a fraction of white
    pub median_target: f32,
    /// Hard cap on the brightening gain
    pub max_gain: f32,
    /// Output level (fraction of white) above which highlights roll off
    pub highlight_knee: f32,
}

impl Default for AvgConfig {
    fn default() -> Self {
        Self {
            median_target: 0.35,
            max_gain: 4.0,
            highlight_knee: 0.8,
        }
    }
}

impl AvgConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.median_target > 0.0 && self.median_target < 1.0) {
            return Err(crate::errors::ProcessorError::invalid_config(
                "median_target must be in (0, 1)",
            ));
        }
        if !(self.max_gain >= 1.0) {
            return Err(crate::errors::ProcessorError::invalid_config(
                "max_gain must be at least 1",
            ));
        }
        if !(self.highlight_knee > 0.0 && self.highlight_knee < 1.0) {
            return Err(crate::errors::ProcessorError::invalid_config(
                "highlight_knee must be in (0, 1)",
            ));
        }
        Ok(())
    }

    /// Largest gain allowed for `frame_count` averaged frames
    pub fn gain_limit(&self, frame_count: u32, iso: i32) -> f32 {
        if iso < BRIGHTEN_MIN_ISO {
            return 1.0;
        }
        (1.0 + 0.5 * (frame_count as f32).sqrt()).min(self.max_gain)
    }

    pub fn gain_for(&self, median: f32, frame_count: u32, iso: i32) -> f32 {
        let limit = self.gain_limit(frame_count, iso);
        if median <= 0.0 {
            return limit;
        }
        (self.median_target * 255.0 / median).clamp(1.0, limit)
    }
}

/// Gain then soft shoulder; slope 1 at the knee, approaches white
#[inline]
fn shoulder(value: f32, gain: f32, knee: f32) -> f32 {
    let x = value * gain;
    if x <= knee {
        return x;
    }
    let room = 255.0 - knee;
    knee + room * (1.0 - (-(x - knee) / room).exp())
}

/// Median of the per-pixel channel average, computed on rounded levels
fn median_level(mean: &[f32]) -> f32 {
    let mut hist = [0u64; 256];
    for px in mean.chunks_exact(3) {
        let level = ((px[0] + px[1] + px[2]) / 3.0).round().clamp(0.0, 255.0) as usize;
        hist[level] += 1;
    }
    let total: u64 = hist.iter().sum();
    let mut cumulative = 0;
    for (level, &count) in hist.iter().enumerate() {
        cumulative += count;
        if count > 0 && cumulative * 2 >= total {
            return level as f32;
        }
    }
    0.0
}

/// Turn the running mean into an 8-bit frame
pub fn brighten(
    mean: &[f32],
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_count: u32,
    iso: i32,
    config: &AvgConfig,
) -> Result<FrameBuffer> {
    let median = median_level(mean);
    let gain = config.gain_for(median, frame_count, iso);
    let knee = config.highlight_knee * 255.0;

    log::info!(
        "Brightening average of {} frames: median {:.0}, gain {:.3}",
        frame_count,
        median,
        gain
    );

    let bpp = format.bytes_per_pixel();
    let mut data = try_buffer(width as usize * height as usize * bpp, 255u8, "brightened frame")?;
    let columns = width as usize;
    data.par_chunks_mut(bpp)
        .zip(mean.par_chunks(3))
        .enumerate()
        .for_each(|(i, (dst, src))| {
            // a gain above one spreads levels apart; dither before it
            let d = if gain == 1.0 {
                0.0
            } else {
                dither::triangular(i % columns, i / columns)
            };
            for c in 0..3 {
                let v = if gain == 1.0 {
                    src[c]
                } else if src[c] <= 0.0 {
                    0.0
                } else {
                    shoulder((src[c] + d).max(0.0), gain, knee)
                };
                dst[c] = v.round().clamp(0.0, 255.0) as u8;
            }
        });

    Ok(FrameBuffer::new(data, width, height, format))
}
