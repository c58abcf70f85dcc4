//! Multi-frame averaging for noise reduction
//!
//! Frames arrive one at a time and are folded into a fixed-size running sum
//! at a working resolution chosen from ISO and exposure. The handle owns its
//! state explicitly: `brighten` takes it, and any error during `update`
//! discards it, so a consumed or half-updated state can never be reused.

pub mod brighten;

use crate::align::pyramid::LumaPlane;
use crate::align::{plane_sharpness, AlignConfig, Aligner, PreparedFrame};
use crate::errors::{try_buffer, ProcessorError, Result};
use crate::ghost::{GhostConfig, GhostMask};
use crate::hdr::FusionOutput;
use crate::histogram::analyze;
use crate::types::{AlignmentOffset, CaptureMetadata, FrameBuffer, FusionDiagnostics, PixelFormat};
use rayon::prelude::*;
use std::time::Instant;

pub use brighten::AvgConfig;

/// Downsample factor for a capture
///
/// Noisy captures are averaged at half resolution, which bounds the work per
/// frame and already removes much of the noise.
pub fn sample_size(iso: i32, exposure_time_ns: i64) -> u32 {
    const LONG_EXPOSURE_NS: i64 = 1_000_000_000 / 15;
    if iso >= 1100 || (iso >= 700 && exposure_time_ns >= LONG_EXPOSURE_NS) {
        2
    } else {
        1
    }
}

/// Settings shared by every call on one accumulator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatorSettings {
    pub align: AlignConfig,
    pub ghost: GhostConfig,
    pub avg: AvgConfig,
}

/// RGB frame at the working resolution
struct WorkingFrame {
    width: usize,
    height: usize,
    rgb: Vec<f32>,
}

impl WorkingFrame {
    fn from_frame(frame: &FrameBuffer, sample_size: u32) -> Result<Self> {
        let scale = sample_size.max(1) as usize;
        let src_width = frame.width as usize;
        let src_height = frame.height as usize;
        let width = (src_width / scale).max(1);
        let height = (src_height / scale).max(1);
        let bpp = frame.format.bytes_per_pixel();
        let mut rgb = try_buffer(width * height * 3, 0.0f32, "working frame")?;

        rgb.par_chunks_mut(width * 3).enumerate().for_each(|(y, row)| {
            for x in 0..width {
                let mut acc = [0.0f32; 3];
                let mut count = 0.0f32;
                for sy in (y * scale)..((y + 1) * scale).min(src_height) {
                    for sx in (x * scale)..((x + 1) * scale).min(src_width) {
                        let idx = (sy * src_width + sx) * bpp;
                        for c in 0..3 {
                            acc[c] += frame.data[idx + c] as f32;
                        }
                        count += 1.0;
                    }
                }
                for c in 0..3 {
                    row[x * 3 + c] = acc[c] / count.max(1.0);
                }
            }
        });

        Ok(Self { width, height, rgb })
    }

    fn luma(&self) -> LumaPlane {
        let data = self
            .rgb
            .chunks_exact(3)
            .map(|px| 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2])
            .collect();
        LumaPlane::new(self.width, self.height, data)
    }

    #[inline]
    fn sample(&self, x: i64, y: i64) -> Option<&[f32]> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        let idx = (y as usize * self.width + x as usize) * 3;
        Some(&self.rgb[idx..idx + 3])
    }
}

/// Running state of one averaging sequence
pub struct AccumulatorState {
    input_dims: (u32, u32),
    format: PixelFormat,
    sample_size: u32,
    width: usize,
    height: usize,
    /// Weighted RGB sum; `sum / weight` is the current average
    sum: Vec<f32>,
    weight: f32,
    frame_count: u32,
    reference: PreparedFrame,
    reference_plane: LumaPlane,
    diagnostics: FusionDiagnostics,
}

impl AccumulatorState {
    pub fn working_dimensions(&self) -> (u32, u32) {
        (self.width as u32, self.height as u32)
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    /// Add `frame` (aligned by `offset`) with the existing average weighted
    /// by `avg_factor`; ghost pixels repeat the average
    fn accumulate(
        &mut self,
        frame: &WorkingFrame,
        offset: AlignmentOffset,
        mask: &GhostMask,
        avg_factor: f32,
    ) {
        let width = self.width;
        let keep = avg_factor / self.weight;
        let average_scale = 1.0 / self.weight;

        self.sum
            .par_chunks_mut(width * 3)
            .enumerate()
            .for_each(|(y, row)| {
                for x in 0..width {
                    let px = &mut row[x * 3..x * 3 + 3];
                    let sample = if mask.is_ghost(x, y) {
                        None
                    } else {
                        frame.sample(x as i64 + offset.dx as i64, y as i64 + offset.dy as i64)
                    };
                    for c in 0..3 {
                        let value = match sample {
                            Some(s) => s[c],
                            None => px[c] * average_scale,
                        };
                        px[c] = px[c] * keep + value;
                    }
                }
            });

        self.weight = avg_factor + 1.0;
        self.frame_count += 1;
    }
}

/// Handle for an averaging sequence
pub struct Accumulator {
    align: AlignConfig,
    ghost: GhostConfig,
    avg: AvgConfig,
    state: Option<AccumulatorState>,
}

impl Accumulator {
    /// Start a sequence from its first two frames
    ///
    /// The sharper frame becomes the fixed alignment reference. `avg_factor`
    /// weights that reference against the other frame.
    pub fn init(
        frame0: FrameBuffer,
        frame1: FrameBuffer,
        avg_factor: f32,
        metadata: &CaptureMetadata,
        settings: AccumulatorSettings,
    ) -> Result<Self> {
        let start = Instant::now();
        settings.align.validate()?;
        settings.ghost.validate()?;
        settings.avg.validate()?;
        metadata.validate()?;
        check_avg_factor(avg_factor)?;
        frame0.check()?;
        check_matches(frame0.dimensions(), frame0.format, &frame1)?;

        let sample_size = sample_size(metadata.iso, metadata.exposure_time_ns);
        log::info!(
            "Starting average at {}x{} (iso {}, sample size {})",
            frame0.width,
            frame0.height,
            metadata.iso,
            sample_size
        );

        let input_dims = frame0.dimensions();
        let format = frame0.format;
        let working0 = WorkingFrame::from_frame(&frame0, sample_size)?;
        let working1 = WorkingFrame::from_frame(&frame1, sample_size)?;
        drop(frame0);
        drop(frame1);

        let plane0 = working0.luma();
        let plane1 = working1.luma();
        let sharp_index = if plane_sharpness(&plane1) > plane_sharpness(&plane0) {
            1
        } else {
            0
        };
        let (reference, other, reference_plane, other_plane) = if sharp_index == 0 {
            (working0, working1, plane0, plane1)
        } else {
            (working1, working0, plane1, plane0)
        };

        let aligner = Aligner::new(settings.align.clone().with_zoom(metadata.zoom_factor))?;
        let prepared_reference = aligner.prepare_plane(reference_plane.clone());
        let prepared_other = aligner.prepare_plane(other_plane.clone());
        let result = aligner.align_prepared(
            &prepared_reference,
            &prepared_other,
            AlignmentOffset::ZERO,
            None,
        )?;
        let offset = result.accepted_offset();
        if !result.confident {
            log::warn!("Initial average alignment not confident, using zero offset");
        }

        let threshold = settings.ghost.noise_threshold(metadata.iso);
        let mask = GhostMask::detect(&reference_plane, &other_plane, offset, threshold, &settings.ghost)?;

        let mut sum = try_buffer(reference.rgb.len(), 0.0f32, "accumulator sum")?;
        sum.copy_from_slice(&reference.rgb);

        let mut offsets = [AlignmentOffset::ZERO; 2];
        let mut confident = [true; 2];
        offsets[1 - sharp_index] = offset;
        confident[1 - sharp_index] = result.confident;

        let mut state = AccumulatorState {
            input_dims,
            format,
            sample_size,
            width: reference.width,
            height: reference.height,
            sum,
            weight: 1.0,
            frame_count: 1,
            reference: prepared_reference,
            reference_plane,
            diagnostics: FusionDiagnostics {
                offsets: offsets.to_vec(),
                confident: confident.to_vec(),
                sharp_index,
                sample_size,
                processing_time_ms: 0,
            },
        };
        state.accumulate(&other, offset, &mask, avg_factor);
        state.diagnostics.processing_time_ms = start.elapsed().as_millis() as u64;

        Ok(Self {
            align: settings.align,
            ghost: settings.ghost,
            avg: settings.avg,
            state: Some(state),
        })
    }

    /// Fold one more frame into the average
    ///
    /// On error the state is discarded and later calls fail with
    /// [`ProcessorError::StateConsumed`].
    pub fn update(
        &mut self,
        frame: FrameBuffer,
        avg_factor: f32,
        metadata: &CaptureMetadata,
    ) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Err(ProcessorError::consumed("accumulator"));
        };

        let result = Self::update_state(state, &self.align, &self.ghost, frame, avg_factor, metadata);
        if let Err(e) = &result {
            log::warn!("Average update failed, discarding state: {}", e);
            self.state = None;
        }
        result
    }

    fn update_state(
        state: &mut AccumulatorState,
        align: &AlignConfig,
        ghost: &GhostConfig,
        frame: FrameBuffer,
        avg_factor: f32,
        metadata: &CaptureMetadata,
    ) -> Result<()> {
        let start = Instant::now();
        metadata.validate()?;
        check_avg_factor(avg_factor)?;
        check_matches(state.input_dims, state.format, &frame)?;

        let working = WorkingFrame::from_frame(&frame, state.sample_size)?;
        drop(frame);
        crate::assert_invariant!(
            (working.width, working.height) == (state.width, state.height),
            "Averaged frames share one working resolution",
            "avg"
        );

        let plane = working.luma();
        let aligner = Aligner::new(align.clone().with_zoom(metadata.zoom_factor))?;
        let prepared = aligner.prepare_plane(plane.clone());
        let result = aligner.align_prepared(&state.reference, &prepared, AlignmentOffset::ZERO, None)?;
        let offset = result.accepted_offset();
        if !result.confident {
            log::warn!(
                "Frame {} alignment not confident, using zero offset",
                state.frame_count + 1
            );
        }

        let threshold = ghost.noise_threshold(metadata.iso);
        let mask = GhostMask::detect(&state.reference_plane, &plane, offset, threshold, ghost)?;
        state.accumulate(&working, offset, &mask, avg_factor);

        log::debug!(
            "Averaged frame {} offset ({}, {}) ghosts {:.1}%",
            state.frame_count,
            offset.dx,
            offset.dy,
            mask.ghost_fraction() * 100.0
        );

        state.diagnostics.offsets = vec![AlignmentOffset::ZERO, offset];
        state.diagnostics.confident = vec![true, result.confident];
        state.diagnostics.processing_time_ms = start.elapsed().as_millis() as u64;
        Ok(())
    }

    /// Produce the final frame and release the state
    pub fn brighten(&mut self, metadata: &CaptureMetadata) -> Result<FusionOutput> {
        let Some(state) = self.state.take() else {
            return Err(ProcessorError::consumed("accumulator"));
        };
        let start = Instant::now();

        let mut mean = state.sum;
        let scale = 1.0 / state.weight;
        mean.par_iter_mut().for_each(|v| *v *= scale);

        let frame = brighten::brighten(
            &mean,
            state.width as u32,
            state.height as u32,
            state.format,
            state.frame_count,
            metadata.iso,
            &self.avg,
        )?;
        drop(mean);

        crate::assert_invariant!(
            frame.dimensions()
                == (
                    (state.input_dims.0 / state.sample_size).max(1),
                    (state.input_dims.1 / state.sample_size).max(1)
                ),
            "Averaged output is at the working resolution",
            "avg"
        );

        let mut diagnostics = state.diagnostics;
        diagnostics.processing_time_ms = start.elapsed().as_millis() as u64;
        log::info!("Average of {} frames complete", state.frame_count);

        Ok(FusionOutput {
            histogram: analyze(&frame),
            frame,
            diagnostics,
        })
    }

    /// Release the state without producing output
    pub fn destroy(&mut self) {
        if self.state.take().is_some() {
            log::debug!("Accumulator destroyed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    pub fn frame_count(&self) -> Option<u32> {
        self.state.as_ref().map(|s| s.frame_count)
    }

    pub fn state(&self) -> Option<&AccumulatorState> {
        self.state.as_ref()
    }

    /// Offsets of the most recent call, at the working resolution
    pub fn diagnostics(&self) -> Option<&FusionDiagnostics> {
        self.state.as_ref().map(|s| &s.diagnostics)
    }
}

fn check_avg_factor(avg_factor: f32) -> Result<()> {
    if !(avg_factor.is_finite() && avg_factor > 0.0) {
        return Err(ProcessorError::invalid_config(format!(
            "avg_factor must be finite and positive, got {}",
            avg_factor
        )));
    }
    Ok(())
}

fn check_matches(dims: (u32, u32), format: PixelFormat, frame: &FrameBuffer) -> Result<()> {
    frame.check()?;
    if frame.dimensions() != dims {
        return Err(ProcessorError::DimensionMismatch {
            expected: dims,
            got: frame.dimensions(),
        });
    }
    if frame.format != format {
        return Err(ProcessorError::FormatMismatch {
            expected: format,
            got: frame.format,
        });
    }
    Ok(())
}
