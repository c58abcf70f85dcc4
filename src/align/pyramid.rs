//! Luminance planes and image pyramids used by the aligner
//!
//! Planes are stored as `f32` so normalization and averaging keep precision
//! across pyramid levels.

use crate::errors::{try_buffer, Result};
use crate::types::{luminance, FrameBuffer};
use rayon::prelude::*;

/// Smallest side a pyramid level may have
pub const MIN_LEVEL_SIZE: usize = 8;

/// Single-channel luminance image
#[derive(Debug, Clone, PartialEq)]
pub struct LumaPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl LumaPlane {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            width,
            height,
            data,
        }
    }

    /// Luminance of a frame, box-averaged down by `scale` (1 = full size)
    pub fn from_frame(frame: &FrameBuffer, scale: usize) -> Result<Self> {
        let scale = scale.max(1);
        let src_width = frame.width as usize;
        let width = (src_width / scale).max(1);
        let height = (frame.height as usize / scale).max(1);
        let bpp = frame.format.bytes_per_pixel();
        let mut data = try_buffer(width * height, 0.0f32, "luma plane")?;

        data.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                let mut count = 0;
                for sy in (y * scale)..((y + 1) * scale).min(frame.height as usize) {
                    for sx in (x * scale)..((x + 1) * scale).min(src_width) {
                        let idx = (sy * src_width + sx) * bpp;
                        sum += luminance(&frame.data[idx..idx + 3]);
                        count += 1;
                    }
                }
                *out = if count > 0 { sum / count as f32 } else { 0.0 };
            }
        });

        Ok(Self::new(width, height, data))
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Sample with signed coordinates, `None` outside the plane
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64) -> Option<f32> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            None
        } else {
            Some(self.data[y as usize * self.width + x as usize])
        }
    }

    /// Downsample by 2x using 2x2 average pooling
    pub fn downsample(&self) -> Self {
        let new_width = (self.width / 2).max(1);
        let new_height = (self.height / 2).max(1);
        let mut data = vec![0.0f32; new_width * new_height];

        for y in 0..new_height {
            for x in 0..new_width {
                let mut sum = 0.0;
                let mut count = 0;
                for dy in 0..2 {
                    for dx in 0..2 {
                        let sx = x * 2 + dx;
                        let sy = y * 2 + dy;
                        if sx < self.width && sy < self.height {
                            sum += self.get(sx, sy);
                            count += 1;
                        }
                    }
                }
                data[y * new_width + x] = sum / count.max(1) as f32;
            }
        }

        Self::new(new_width, new_height, data)
    }

    pub fn mean_and_std(&self) -> (f32, f32) {
        let n = self.data.len().max(1) as f64;
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = self
            .data
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / n;
        (mean as f32, var.sqrt() as f32)
    }

    /// Zero-mean, unit-variance copy; flat planes normalize to all zeros
    pub fn normalized(&self) -> Self {
        let (mean, std) = self.mean_and_std();
        let data = if std < 1e-3 {
            vec![0.0; self.data.len()]
        } else {
            self.data.iter().map(|&v| (v - mean) / std).collect()
        };
        Self::new(self.width, self.height, data)
    }

    /// Sample at `(x + dx, y + dy)`, `None` when that falls outside
    pub fn sample_shifted(&self, x: usize, y: usize, dx: i32, dy: i32) -> Option<f32> {
        self.get_checked(x as i64 + dx as i64, y as i64 + dy as i64)
    }
}

/// Build a pyramid with `levels` entries, finest first
///
/// Stops early once a level would fall below [`MIN_LEVEL_SIZE`].
pub fn build_pyramid(base: LumaPlane, levels: usize) -> Vec<LumaPlane> {
    let mut pyramid = Vec::with_capacity(levels.max(1));
    pyramid.push(base);

    while pyramid.len() < levels {
        let Some(last) = pyramid.last() else { break };
        if last.width / 2 < MIN_LEVEL_SIZE || last.height / 2 < MIN_LEVEL_SIZE {
            break;
        }
        let next = last.downsample();
        pyramid.push(next);
    }

    pyramid
}

/// Power-of-two factor that brings the larger side to at most `max_dimension`
pub fn working_scale(width: u32, height: u32, max_dimension: u32) -> usize {
    let mut scale = 1usize;
    let largest = width.max(height) as usize;
    let max_dimension = max_dimension.max(MIN_LEVEL_SIZE as u32) as usize;
    while largest / scale > max_dimension {
        scale *= 2;
    }
    scale
}
