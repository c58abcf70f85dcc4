//! Frame alignment
//!
//! Computes integer translations between frames with a coarse-to-fine
//! search over luminance pyramids:
//! 1. Reduce both frames to a working resolution
//! 2. Exhaustively search a window at the coarsest pyramid level
//! 3. Refine the best offset within a small radius at every finer level
//! 4. Judge confidence from the cost landscape
//!
//! Alignment never fails outright: when the scene has no usable texture the
//! result is flagged as not confident and callers fall back to the search
//! center (usually `(0, 0)`).

pub mod pyramid;

use crate::errors::{ProcessorError, Result};
use crate::types::{AlignmentOffset, FrameBuffer};
use pyramid::{build_pyramid, working_scale, LumaPlane};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Upper bound on samples evaluated per candidate offset
const MAX_COST_SAMPLES: usize = 40_000;

/// Minimum share of the search region two frames must overlap
const MIN_OVERLAP_FRACTION: f32 = 0.25;

/// Costs closer than this are treated as a tie
const COST_EPSILON: f32 = 1e-6;

/// Matching cost used to compare frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchCost {
    /// Mean absolute difference of raw luminance (same-exposure frames)
    Sad,
    /// Mean absolute difference of mean/std-normalized luminance, robust to
    /// exposure differences between frames
    Normalized,
}

/// Aligner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    /// Pyramid levels (2-4)
    pub levels: u32,

    /// Exhaustive search radius at the coarsest level (coarse pixels)
    pub coarse_radius: u32,

    /// Refinement radius at each finer level
    pub refine_radius: u32,

    /// Largest accepted displacement from the search center (full-res pixels)
    pub max_displacement: u32,

    /// Relative cost improvement the best offset must show over the center
    pub min_improvement: f32,

    /// Relative gap between mean window cost and best cost below which the
    /// scene is considered featureless
    pub min_contrast: f32,

    /// Restrict matching to a central crop (fraction of each side)
    pub crop_fraction: Option<f32>,

    /// Frames are box-downsampled by powers of two until their larger side
    /// fits this size
    pub working_max_dimension: u32,

    pub cost: MatchCost,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            coarse_radius: 8,
            refine_radius: 2,
            max_displacement: 64,
            min_improvement: 0.02,
            min_contrast: 0.05,
            crop_fraction: None,
            working_max_dimension: 1024,
            cost: MatchCost::Sad,
        }
    }
}

impl AlignConfig {
    pub fn validate(&self) -> Result<()> {
        if !(2..=4).contains(&self.levels) {
            return Err(ProcessorError::invalid_config(
                "alignment levels must be between 2 and 4",
            ));
        }
        if self.coarse_radius == 0 {
            return Err(ProcessorError::invalid_config(
                "coarse search radius must be positive",
            ));
        }
        if !(0.0..1.0).contains(&self.min_improvement) {
            return Err(ProcessorError::invalid_config(
                "min_improvement must be in [0, 1)",
            ));
        }
        if !(0.0..1.0).contains(&self.min_contrast) {
            return Err(ProcessorError::invalid_config(
                "min_contrast must be in [0, 1)",
            ));
        }
        if let Some(fraction) = self.crop_fraction {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(ProcessorError::invalid_config(
                    "crop fraction must be in (0, 1]",
                ));
            }
        }
        if self.working_max_dimension < 16 {
            return Err(ProcessorError::invalid_config(
                "working_max_dimension must be at least 16",
            ));
        }
        Ok(())
    }

    /// Widen the coarse search for zoomed captures, where hand shake covers
    /// more pixels
    pub fn with_zoom(mut self, zoom_factor: f32) -> Self {
        let zoom = if zoom_factor.is_finite() {
            zoom_factor.max(1.0)
        } else {
            1.0
        };
        self.coarse_radius = self.coarse_radius.saturating_mul(zoom.ceil() as u32);
        self
    }
}

/// Outcome of aligning one frame against a reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentResult {
    /// Best-effort offset in input-frame pixels
    pub offset: AlignmentOffset,

    /// Whether the offset can be trusted
    pub confident: bool,

    /// Matching cost at `offset`
    pub cost: f32,

    /// Matching cost at the search center
    pub center_cost: f32,

    /// Where the search was centered (the seed, `(0, 0)` when unseeded)
    pub search_center: AlignmentOffset,
}

impl AlignmentResult {
    /// Result for the reference frame itself
    pub fn reference() -> Self {
        Self {
            offset: AlignmentOffset::ZERO,
            confident: true,
            cost: 0.0,
            center_cost: 0.0,
            search_center: AlignmentOffset::ZERO,
        }
    }

    /// The offset to apply: the measured one when confident, otherwise the
    /// search center
    pub fn accepted_offset(&self) -> AlignmentOffset {
        if self.confident {
            self.offset
        } else {
            self.search_center
        }
    }
}

/// Luminance pyramid of one frame at the working resolution
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    /// Finest level first
    pyramid: Vec<LumaPlane>,
    /// Downsample factor from the input frame to `pyramid[0]`
    scale: usize,
}

impl PreparedFrame {
    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn working_plane(&self) -> &LumaPlane {
        &self.pyramid[0]
    }
}

/// Search window in reference coordinates at one level
#[derive(Debug, Clone, Copy)]
struct Region {
    x0: i64,
    y0: i64,
    x1: i64,
    y1: i64,
}

impl Region {
    fn for_plane(plane: &LumaPlane, crop_fraction: Option<f32>) -> Self {
        let (w, h) = (plane.width as i64, plane.height as i64);
        match crop_fraction {
            Some(fraction) if fraction < 1.0 => {
                let cw = ((w as f32 * fraction).round() as i64).clamp(1, w);
                let ch = ((h as f32 * fraction).round() as i64).clamp(1, h);
                let x0 = (w - cw) / 2;
                let y0 = (h - ch) / 2;
                Region {
                    x0,
                    y0,
                    x1: x0 + cw,
                    y1: y0 + ch,
                }
            }
            _ => Region {
                x0: 0,
                y0: 0,
                x1: w,
                y1: h,
            },
        }
    }

    fn area(&self) -> i64 {
        (self.x1 - self.x0).max(0) * (self.y1 - self.y0).max(0)
    }
}

/// Result of searching a single pyramid level
#[derive(Debug, Clone, Copy)]
struct LevelSearch {
    best: (i32, i32),
    best_cost: f32,
    mean_cost: f32,
}

pub struct Aligner {
    config: AlignConfig,
}

impl Aligner {
    pub fn new(config: AlignConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    /// Build the working-resolution pyramid for a frame
    pub fn prepare(&self, frame: &FrameBuffer) -> Result<PreparedFrame> {
        frame.check()?;
        let scale = working_scale(frame.width, frame.height, self.config.working_max_dimension);
        let plane = LumaPlane::from_frame(frame, scale)?;
        Ok(self.prepare_with_scale(plane, scale))
    }

    /// Build a pyramid from a luma plane; offsets found with it are in plane
    /// pixels
    pub fn prepare_plane(&self, plane: LumaPlane) -> PreparedFrame {
        let scale = working_scale(
            plane.width as u32,
            plane.height as u32,
            self.config.working_max_dimension,
        );
        let mut plane = plane;
        let mut reduced = 1;
        while reduced < scale {
            plane = plane.downsample();
            reduced *= 2;
        }
        self.prepare_with_scale(plane, scale)
    }

    fn prepare_with_scale(&self, plane: LumaPlane, scale: usize) -> PreparedFrame {
        let mut pyramid = build_pyramid(plane, self.config.levels as usize);
        if self.config.cost == MatchCost::Normalized {
            pyramid = pyramid.iter().map(LumaPlane::normalized).collect();
        }
        PreparedFrame { pyramid, scale }
    }

    /// Align `candidate` to `reference` with an unseeded search
    pub fn align(&self, reference: &FrameBuffer, candidate: &FrameBuffer) -> Result<AlignmentResult> {
        check_same_shape(reference, candidate)?;
        let reference = self.prepare(reference)?;
        let candidate = self.prepare(candidate)?;
        self.align_prepared(&reference, &candidate, AlignmentOffset::ZERO, None)
    }

    /// Align around a predicted offset, searching `radius` full-resolution
    /// pixels in each direction
    pub fn align_seeded(
        &self,
        reference: &FrameBuffer,
        candidate: &FrameBuffer,
        seed: AlignmentOffset,
        radius: u32,
    ) -> Result<AlignmentResult> {
        check_same_shape(reference, candidate)?;
        let reference = self.prepare(reference)?;
        let candidate = self.prepare(candidate)?;
        self.align_prepared(&reference, &candidate, seed, Some(radius))
    }

    /// Align two prepared frames
    ///
    /// `seed` is in input-frame pixels. `radius` overrides the configured
    /// coarse radius (input-frame pixels).
    pub fn align_prepared(
        &self,
        reference: &PreparedFrame,
        candidate: &PreparedFrame,
        seed: AlignmentOffset,
        radius: Option<u32>,
    ) -> Result<AlignmentResult> {
        let (rw, rh) = (reference.pyramid[0].width, reference.pyramid[0].height);
        let (cw, ch) = (candidate.pyramid[0].width, candidate.pyramid[0].height);
        if reference.scale != candidate.scale || (rw, rh) != (cw, ch) {
            return Err(ProcessorError::DimensionMismatch {
                expected: ((rw * reference.scale) as u32, (rh * reference.scale) as u32),
                got: ((cw * candidate.scale) as u32, (ch * candidate.scale) as u32),
            });
        }

        let scale = reference.scale as i32;
        let levels = reference.pyramid.len().min(candidate.pyramid.len());
        let coarsest = levels - 1;
        let coarse_factor = 1i32 << coarsest;

        let seed_working = (div_round(seed.dx, scale), div_round(seed.dy, scale));
        let seed_at = |level: usize| {
            (
                div_round(seed_working.0, 1 << level),
                div_round(seed_working.1, 1 << level),
            )
        };

        let coarse_radius = match radius {
            Some(r) => {
                let working = (r as i32 + scale - 1) / scale;
                ((working + coarse_factor - 1) / coarse_factor).max(1)
            }
            None => self.config.coarse_radius as i32,
        };

        log::debug!(
            "Aligning at {}x{} (scale {}), {} levels, coarse radius {} around {:?}",
            rw,
            rh,
            scale,
            levels,
            coarse_radius,
            seed_working
        );

        let coarse = self.search_level(
            &reference.pyramid[coarsest],
            &candidate.pyramid[coarsest],
            seed_at(coarsest),
            coarse_radius,
            seed_at(coarsest),
        );

        let contrast = if coarse.mean_cost > COST_EPSILON && coarse.best_cost.is_finite() {
            (coarse.mean_cost - coarse.best_cost) / coarse.mean_cost
        } else {
            0.0
        };

        let mut best = coarse.best;
        let mut best_cost = coarse.best_cost;
        for level in (0..coarsest).rev() {
            let refined = self.search_level(
                &reference.pyramid[level],
                &candidate.pyramid[level],
                (best.0 * 2, best.1 * 2),
                self.config.refine_radius as i32,
                seed_at(level),
            );
            best = refined.best;
            best_cost = refined.best_cost;
        }

        let finest_region = Region::for_plane(&reference.pyramid[0], self.config.crop_fraction);
        let center_cost = offset_cost(
            &reference.pyramid[0],
            &candidate.pyramid[0],
            finest_region,
            seed_working,
        )
        .unwrap_or(f32::INFINITY);

        let improved = best == seed_working
            || best_cost <= center_cost * (1.0 - self.config.min_improvement);

        let offset = AlignmentOffset::new(best.0, best.1).scaled(scale);
        let search_center = AlignmentOffset::new(seed_working.0, seed_working.1).scaled(scale);
        crate::assert_invariant!(
            offset.dx % scale == 0 && offset.dy % scale == 0,
            "Working-resolution offsets are rescaled to input pixels",
            "align"
        );

        let within_limit =
            offset.max_abs_delta(&search_center) <= self.config.max_displacement as i32;
        let textured = contrast >= self.config.min_contrast;
        let confident = textured && improved && within_limit && best_cost.is_finite();

        if !confident {
            log::debug!(
                "Alignment not confident: contrast={:.4} improved={} within_limit={} offset={:?}",
                contrast,
                improved,
                within_limit,
                offset
            );
        }

        Ok(AlignmentResult {
            offset,
            confident,
            cost: best_cost,
            center_cost,
            search_center,
        })
    }

    /// Align every frame to `frames[base_index]`
    pub fn align_to_reference(
        &self,
        frames: &[FrameBuffer],
        base_index: usize,
    ) -> Result<Vec<AlignmentResult>> {
        if frames.is_empty() {
            return Err(ProcessorError::EmptyInput);
        }
        if base_index >= frames.len() {
            return Err(ProcessorError::invalid_config(format!(
                "base index {} out of range for {} frames",
                base_index,
                frames.len()
            )));
        }

        log::info!("Aligning {} frames to frame {}", frames.len(), base_index);

        let reference = &frames[base_index];
        let prepared_reference = self.prepare(reference)?;
        let mut results = Vec::with_capacity(frames.len());

        for (idx, frame) in frames.iter().enumerate() {
            if idx == base_index {
                results.push(AlignmentResult::reference());
                continue;
            }
            check_same_shape(reference, frame)?;
            let prepared = self.prepare(frame)?;
            let result =
                self.align_prepared(&prepared_reference, &prepared, AlignmentOffset::ZERO, None)?;
            log::debug!(
                "Frame {} offset ({}, {}), confident={}",
                idx,
                result.offset.dx,
                result.offset.dy,
                result.confident
            );
            results.push(result);
        }

        Ok(results)
    }

    fn search_level(
        &self,
        reference: &LumaPlane,
        candidate: &LumaPlane,
        center: (i32, i32),
        radius: i32,
        prefer: (i32, i32),
    ) -> LevelSearch {
        let region = Region::for_plane(reference, self.config.crop_fraction);

        let mut offsets = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
        for dy in (center.1 - radius)..=(center.1 + radius) {
            for dx in (center.0 - radius)..=(center.0 + radius) {
                offsets.push((dx, dy));
            }
        }

        let costs: Vec<((i32, i32), Option<f32>)> = offsets
            .par_iter()
            .map(|&offset| (offset, offset_cost(reference, candidate, region, offset)))
            .collect();

        let mut best = center;
        let mut best_cost = f32::INFINITY;
        let mut total = 0.0f64;
        let mut counted = 0usize;

        for (offset, cost) in costs {
            let Some(cost) = cost else { continue };
            total += cost as f64;
            counted += 1;

            let closer = distance_sq(offset, prefer) < distance_sq(best, prefer);
            if cost < best_cost - COST_EPSILON
                || ((cost - best_cost).abs() <= COST_EPSILON && closer)
            {
                best = offset;
                best_cost = cost;
            }
        }

        let mean_cost = if counted > 0 {
            (total / counted as f64) as f32
        } else {
            0.0
        };

        LevelSearch {
            best,
            best_cost,
            mean_cost,
        }
    }
}

/// Mean absolute difference over the overlap of `region` with the shifted
/// candidate; `None` when the overlap is too small
fn offset_cost(
    reference: &LumaPlane,
    candidate: &LumaPlane,
    region: Region,
    offset: (i32, i32),
) -> Option<f32> {
    let (dx, dy) = (offset.0 as i64, offset.1 as i64);
    let xs = region.x0.max(-dx);
    let xe = region.x1.min(candidate.width as i64 - dx);
    let ys = region.y0.max(-dy);
    let ye = region.y1.min(candidate.height as i64 - dy);
    if xe <= xs || ye <= ys {
        return None;
    }

    let overlap = (xe - xs) * (ye - ys);
    if (overlap as f32) < region.area() as f32 * MIN_OVERLAP_FRACTION {
        return None;
    }

    let step = ((overlap as f64 / MAX_COST_SAMPLES as f64).sqrt().ceil() as i64).max(1);
    let mut sum = 0.0f32;
    let mut count = 0usize;
    let mut y = ys;
    while y < ye {
        let ref_row = y as usize * reference.width;
        let cand_row = (y + dy) as usize * candidate.width;
        let mut x = xs;
        while x < xe {
            let r = reference.data[ref_row + x as usize];
            let c = candidate.data[cand_row + (x + dx) as usize];
            sum += (r - c).abs();
            count += 1;
            x += step;
        }
        y += step;
    }

    Some(sum / count.max(1) as f32)
}

fn distance_sq(a: (i32, i32), b: (i32, i32)) -> i64 {
    let dx = (a.0 - b.0) as i64;
    let dy = (a.1 - b.1) as i64;
    dx * dx + dy * dy
}

/// Integer division rounding to nearest, ties away from zero
fn div_round(value: i32, divisor: i32) -> i32 {
    if divisor <= 1 {
        return value;
    }
    let half = divisor / 2;
    if value >= 0 {
        (value + half) / divisor
    } else {
        -((-value + half) / divisor)
    }
}

fn check_same_shape(reference: &FrameBuffer, frame: &FrameBuffer) -> Result<()> {
    if frame.dimensions() != reference.dimensions() {
        return Err(ProcessorError::DimensionMismatch {
            expected: reference.dimensions(),
            got: frame.dimensions(),
        });
    }
    if frame.format != reference.format {
        return Err(ProcessorError::FormatMismatch {
            expected: reference.format,
            got: frame.format,
        });
    }
    Ok(())
}

/// Translate a frame by an alignment offset
///
/// The output sampled at `(x, y)` takes the input pixel at
/// `(x + dx, y + dy)`; samples outside the frame repeat the nearest edge.
pub fn apply_alignment(frame: &FrameBuffer, offset: AlignmentOffset) -> Result<FrameBuffer> {
    frame.check()?;
    if offset.is_zero() {
        return Ok(frame.clone());
    }

    log::debug!("Applying alignment: offset=({}, {})", offset.dx, offset.dy);

    let width = frame.width as i64;
    let height = frame.height as i64;
    let bpp = frame.format.bytes_per_pixel();
    let row_bytes = width as usize * bpp;
    let mut data = crate::errors::try_buffer(frame.data.len(), 0u8, "aligned frame")?;

    data.par_chunks_mut(row_bytes)
        .enumerate()
        .for_each(|(y, row)| {
            let src_y = (y as i64 + offset.dy as i64).clamp(0, height - 1) as usize;
            for x in 0..width as usize {
                let src_x = (x as i64 + offset.dx as i64).clamp(0, width - 1) as usize;
                let src_idx = (src_y * width as usize + src_x) * bpp;
                row[x * bpp..(x + 1) * bpp].copy_from_slice(&frame.data[src_idx..src_idx + bpp]);
            }
        });

    Ok(FrameBuffer::new(data, frame.width, frame.height, frame.format))
}

/// Mean absolute Laplacian response of the frame's luminance
///
/// Higher is sharper; used to choose the alignment base.
pub fn sharpness_score(frame: &FrameBuffer) -> Result<f32> {
    frame.check()?;
    let plane = LumaPlane::from_frame(frame, 1)?;
    Ok(plane_sharpness(&plane))
}

pub(crate) fn plane_sharpness(plane: &LumaPlane) -> f32 {
    if plane.width < 3 || plane.height < 3 {
        return 0.0;
    }

    let total: f64 = (1..plane.height - 1)
        .into_par_iter()
        .map(|y| {
            let mut row_sum = 0.0f64;
            for x in 1..plane.width - 1 {
                let center = plane.get(x, y);
                let neighbors = plane.get(x - 1, y)
                    + plane.get(x + 1, y)
                    + plane.get(x, y - 1)
                    + plane.get(x, y + 1);
                row_sum += (4.0 * center - neighbors).abs() as f64;
            }
            row_sum
        })
        .sum();

    let count = (plane.width - 2) * (plane.height - 2);
    (total / count as f64) as f32
}
