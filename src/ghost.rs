//! Ghost detection
//!
//! Flags blocks where an aligned candidate still disagrees with the reference
//! (moving subjects the global translation cannot explain). Flagged areas
//! fall back to the reference when frames are blended.

use crate::align::pyramid::LumaPlane;
use crate::errors::{ProcessorError, Result};
use crate::types::AlignmentOffset;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Reference samples at or above this level are clipped and carry no
/// information about motion
const CLIPPED_LEVEL: f32 = 250.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GhostConfig {
    /// Block edge in plane pixels
    pub block_size: u32,
    /// Mean absolute luma difference tolerated at ISO 100
    pub base_threshold: f32,
    /// Upper bound for the noise-adapted threshold
    pub max_threshold: f32,
    /// Grow flagged areas by one block
    pub dilate: bool,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            block_size: 16,
            base_threshold: 10.0,
            max_threshold: 48.0,
            dilate: true,
        }
    }
}

impl GhostConfig {
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(ProcessorError::invalid_config(
                "ghost block size must be positive",
            ));
        }
        if !(self.base_threshold > 0.0 && self.max_threshold >= self.base_threshold) {
            return Err(ProcessorError::invalid_config(
                "ghost thresholds must satisfy 0 < base <= max",
            ));
        }
        Ok(())
    }

    /// Threshold scaled with expected sensor noise
    ///
    /// Shot noise grows with the square root of gain, so the threshold does
    /// too. Unknown ISO uses the base threshold.
    pub fn noise_threshold(&self, iso: i32) -> f32 {
        if iso <= 0 {
            return self.base_threshold;
        }
        let scaled = self.base_threshold * (iso as f32 / 100.0).sqrt();
        scaled.clamp(self.base_threshold, self.max_threshold)
    }
}

/// Per-block motion mask in plane coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct GhostMask {
    width: usize,
    height: usize,
    block_size: usize,
    blocks_x: usize,
    blocks_y: usize,
    flags: Vec<bool>,
}

impl GhostMask {
    /// Mask with nothing flagged
    pub fn empty(width: usize, height: usize, block_size: u32) -> Self {
        let block_size = block_size.max(1) as usize;
        let blocks_x = width.div_ceil(block_size).max(1);
        let blocks_y = height.div_ceil(block_size).max(1);
        Self {
            width,
            height,
            block_size,
            blocks_x,
            blocks_y,
            flags: vec![false; blocks_x * blocks_y],
        }
    }

    /// Compare `reference` against `candidate` shifted by `offset`
    pub fn detect(
        reference: &LumaPlane,
        candidate: &LumaPlane,
        offset: AlignmentOffset,
        threshold: f32,
        config: &GhostConfig,
    ) -> Result<Self> {
        if (reference.width, reference.height) != (candidate.width, candidate.height) {
            return Err(ProcessorError::DimensionMismatch {
                expected: (reference.width as u32, reference.height as u32),
                got: (candidate.width as u32, candidate.height as u32),
            });
        }

        let mut mask = Self::empty(reference.width, reference.height, config.block_size);
        let block = mask.block_size;
        let blocks_x = mask.blocks_x;

        mask.flags
            .par_chunks_mut(blocks_x)
            .enumerate()
            .for_each(|(by, row)| {
                for (bx, flag) in row.iter_mut().enumerate() {
                    *flag = block_disagrees(reference, candidate, offset, threshold, bx, by, block);
                }
            });

        if config.dilate {
            mask.dilate();
        }

        let flagged = mask.flags.iter().filter(|&&f| f).count();
        if flagged > 0 {
            log::debug!(
                "Ghost mask: {}/{} blocks flagged (threshold {:.1})",
                flagged,
                mask.flags.len(),
                threshold
            );
        }

        Ok(mask)
    }

    fn dilate(&mut self) {
        let source = self.flags.clone();
        for by in 0..self.blocks_y {
            for bx in 0..self.blocks_x {
                if source[by * self.blocks_x + bx] {
                    continue;
                }
                let neighbor = (-1i64..=1).any(|oy| {
                    (-1i64..=1).any(|ox| {
                        let nx = bx as i64 + ox;
                        let ny = by as i64 + oy;
                        nx >= 0
                            && ny >= 0
                            && (nx as usize) < self.blocks_x
                            && (ny as usize) < self.blocks_y
                            && source[ny as usize * self.blocks_x + nx as usize]
                    })
                });
                self.flags[by * self.blocks_x + bx] = neighbor;
            }
        }
    }

    #[inline]
    pub fn is_ghost(&self, x: usize, y: usize) -> bool {
        let bx = (x / self.block_size).min(self.blocks_x - 1);
        let by = (y / self.block_size).min(self.blocks_y - 1);
        self.flags[by * self.blocks_x + bx]
    }

    /// Share of flagged blocks
    pub fn ghost_fraction(&self) -> f32 {
        let flagged = self.flags.iter().filter(|&&f| f).count();
        flagged as f32 / self.flags.len().max(1) as f32
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

fn block_disagrees(
    reference: &LumaPlane,
    candidate: &LumaPlane,
    offset: AlignmentOffset,
    threshold: f32,
    bx: usize,
    by: usize,
    block: usize,
) -> bool {
    let x_end = ((bx + 1) * block).min(reference.width);
    let y_end = ((by + 1) * block).min(reference.height);
    let mut sum = 0.0f32;
    let mut count = 0usize;

    for y in (by * block)..y_end {
        for x in (bx * block)..x_end {
            let r = reference.get(x, y);
            match candidate.sample_shifted(x, y, offset.dx, offset.dy) {
                // uncovered by the candidate: nothing to blend there
                None => return true,
                Some(_) if r >= CLIPPED_LEVEL => {}
                Some(c) => {
                    sum += (r - c.clamp(0.0, 255.0)).abs();
                    count += 1;
                }
            }
        }
    }

    count > 0 && sum / count as f32 > threshold
}
