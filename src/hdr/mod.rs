//! HDR fusion and dynamic range optimisation
//!
//! Fuses an exposure bracket into one frame:
//! 1. Order frames by brightness and pick the middle exposure as base
//! 2. Align every frame to the base
//! 3. Fit each frame's exposure response relative to the base
//! 4. Flag ghosts where a mapped frame disagrees with the base
//! 5. Blend with well-exposedness weights into linear radiance
//! 6. Dither, tonemap and enhance local contrast in float, then round to
//!    8 bits once
//!
//! A single frame takes the DRO path instead of steps 1-5.

pub mod contrast;
pub mod dro;
pub mod response;
pub mod tonemap;

use crate::align::pyramid::LumaPlane;
use crate::align::{AlignConfig, Aligner, MatchCost};
use crate::dither;
use crate::errors::{try_buffer, ProcessorError, Result};
use crate::ghost::{GhostConfig, GhostMask};
use crate::histogram::{analyze, HistogramStats};
use crate::types::{
    luminance, AlignmentOffset, CaptureMetadata, FrameBuffer, FusionDiagnostics, PixelFormat,
    ISO_UNKNOWN,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub use contrast::{enhance_levels, enhance_local_contrast};
pub use dro::{DroAlgorithm, GainGamma};
pub use response::ExposureResponse;
pub use tonemap::{tonemap_buffer, tonemap_levels, TonemapAlgorithm};

/// Width of the well-exposedness Gaussian (normalized brightness)
const WELL_EXPOSED_SIGMA: f32 = 0.2;

/// Weight floor that keeps the base frame in every blend
const BASE_WEIGHT_FLOOR: f32 = 1e-3;

/// Channel level treated as clipped
const CLIPPED_CHANNEL: u8 = 250;

/// Exposures shorter than this get contrast enhancement in smart mode
const SMART_EXPOSURE_LIMIT_NS: i64 = 1_000_000_000 / 59;

const DEFAULT_ALPHA: f32 = 0.5;

/// Linear RGB radiance, 1.0 = white of the base exposure
#[derive(Debug, Clone, PartialEq)]
pub struct RadianceBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl RadianceBuffer {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let len = width as usize * height as usize * 3;
        Ok(Self {
            width,
            height,
            data: try_buffer(len, 0.0f32, "radiance buffer")?,
        })
    }

    /// 8-bit frame scaled to `[0, 1]`
    pub fn from_frame(frame: &FrameBuffer) -> Result<Self> {
        frame.check()?;
        let mut buffer = Self::new(frame.width, frame.height)?;
        let bpp = frame.format.bytes_per_pixel();
        buffer
            .data
            .par_chunks_mut(3)
            .zip(frame.data.par_chunks(bpp))
            .for_each(|(dst, src)| {
                for c in 0..3 {
                    dst[c] = src[c] as f32 / 255.0;
                }
            });
        Ok(buffer)
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let idx = (y * self.width as usize + x) * 3;
        &self.data[idx..idx + 3]
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn max_value(&self) -> f32 {
        self.data
            .par_iter()
            .copied()
            .reduce(|| 0.0f32, f32::max)
    }

    pub fn map_values<F>(&mut self, f: F)
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        self.data.par_iter_mut().for_each(|v| *v = f(*v));
    }

    /// Spread every pixel over one input level (`1/255`) of triangular
    /// dither; black pixels stay black
    pub fn dither(&mut self) {
        let width = self.width as usize;
        self.data
            .par_chunks_mut(width * 3)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, px) in row.chunks_exact_mut(3).enumerate() {
                    if px.iter().all(|&v| v <= 0.0) {
                        continue;
                    }
                    let d = dither::triangular(x, y) / 255.0;
                    for v in px.iter_mut() {
                        *v = (*v + d).max(0.0);
                    }
                }
            });
    }
}

/// RGB display levels in `[0, 255]`, kept in float until the final rounding
#[derive(Debug, Clone, PartialEq)]
pub struct LevelBuffer {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl LevelBuffer {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let len = width as usize * height as usize * 3;
        Ok(Self {
            width,
            height,
            data: try_buffer(len, 0.0f32, "level buffer")?,
        })
    }

    pub fn from_frame(frame: &FrameBuffer) -> Result<Self> {
        frame.check()?;
        let mut buffer = Self::new(frame.width, frame.height)?;
        let bpp = frame.format.bytes_per_pixel();
        buffer
            .data
            .par_chunks_mut(3)
            .zip(frame.data.par_chunks(bpp))
            .for_each(|(dst, src)| {
                for c in 0..3 {
                    dst[c] = src[c] as f32;
                }
            });
        Ok(buffer)
    }

    /// Round to an 8-bit frame; `alpha_source` supplies alpha for RGBA output
    pub fn quantize(&self, format: PixelFormat, alpha_source: Option<&FrameBuffer>) -> Result<FrameBuffer> {
        let bpp = format.bytes_per_pixel();
        let pixels = self.width as usize * self.height as usize;
        let mut data = try_buffer(pixels * bpp, 255u8, "quantized frame")?;

        data.par_chunks_mut(bpp)
            .zip(self.data.par_chunks(3))
            .for_each(|(dst, src)| {
                for c in 0..3 {
                    dst[c] = src[c].round().clamp(0.0, 255.0) as u8;
                }
            });

        if let (PixelFormat::Rgba8, Some(source)) = (format, alpha_source) {
            if source.format == PixelFormat::Rgba8 && source.data.len() == data.len() {
                for (dst, src) in data.chunks_exact_mut(4).zip(source.data.chunks_exact(4)) {
                    dst[3] = src[3];
                }
            }
        }

        Ok(FrameBuffer::new(data, self.width, self.height, format))
    }
}

/// User preference for local contrast enhancement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContrastEnhancement {
    Off,
    /// Only for short exposures, where the scene is likely bright
    #[default]
    Smart,
    Always,
}

impl std::str::FromStr for ContrastEnhancement {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(ContrastEnhancement::Off),
            "smart" => Ok(ContrastEnhancement::Smart),
            "always" => Ok(ContrastEnhancement::Always),
            other => Err(format!("unknown contrast enhancement '{}'", other)),
        }
    }
}

/// Contrast enhancement strength for a capture
pub fn hdr_alpha(
    mode: ContrastEnhancement,
    iso: i32,
    exposure_time_ns: i64,
    n_frames: usize,
) -> f32 {
    if n_frames == 1 {
        return DEFAULT_ALPHA;
    }
    if mode == ContrastEnhancement::Always || iso == ISO_UNKNOWN {
        return DEFAULT_ALPHA;
    }
    match mode {
        ContrastEnhancement::Smart if exposure_time_ns < SMART_EXPOSURE_LIMIT_NS => DEFAULT_ALPHA,
        _ => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HdrOptions {
    /// Local contrast strength, 0 disables
    pub alpha: f32,
    pub tonemap: TonemapAlgorithm,
    /// Curve for single-frame input
    pub dro: DroAlgorithm,
    /// Contrast tiles per side
    pub n_tiles: u32,
    pub preserve_blacks: bool,
    /// Frames arrive ordered darkest to brightest
    pub assume_sorted: bool,
}

impl Default for HdrOptions {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            tonemap: TonemapAlgorithm::Reinhard,
            dro: DroAlgorithm::GainGamma,
            n_tiles: 4,
            preserve_blacks: true,
            assume_sorted: true,
        }
    }
}

impl HdrOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha.is_finite() && (0.0..=1.0).contains(&self.alpha)) {
            return Err(ProcessorError::invalid_config(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        contrast::check_tiles(self.n_tiles)
    }

    /// Settings that leave a single frame untouched
    pub fn identity() -> Self {
        Self {
            alpha: 0.0,
            tonemap: TonemapAlgorithm::None,
            ..Default::default()
        }
    }

    fn is_identity(&self) -> bool {
        self.alpha == 0.0 && self.tonemap == TonemapAlgorithm::None
    }
}

/// Fused frame plus everything callers inspect afterwards
#[derive(Debug, Clone)]
pub struct FusionOutput {
    pub frame: FrameBuffer,
    pub histogram: Option<HistogramStats>,
    pub diagnostics: FusionDiagnostics,
}

pub struct FusionEngine {
    aligner: Aligner,
    ghost: GhostConfig,
}

impl FusionEngine {
    pub fn new(align: AlignConfig, ghost: GhostConfig) -> Result<Self> {
        ghost.validate()?;
        Ok(Self {
            aligner: Aligner::new(align)?,
            ghost,
        })
    }

    /// Engine with default settings and exposure-invariant matching
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            AlignConfig {
                cost: MatchCost::Normalized,
                ..Default::default()
            },
            GhostConfig::default(),
        )
    }

    /// Fuse `frames` into one output
    ///
    /// The frames are consumed. One frame runs DRO; two or more run HDR.
    pub fn process(
        &self,
        frames: Vec<FrameBuffer>,
        metadata: &CaptureMetadata,
        options: &HdrOptions,
    ) -> Result<FusionOutput> {
        let start = Instant::now();
        options.validate()?;
        metadata.validate()?;
        validate_frames(&frames)?;

        let input_dims = frames[0].dimensions();
        let mut output = if frames.len() == 1 {
            let mut frames = frames;
            match frames.pop() {
                Some(frame) => self.process_single(frame, options)?,
                None => return Err(ProcessorError::EmptyInput),
            }
        } else {
            self.process_bracket(frames, metadata, options)?
        };

        crate::assert_invariant!(
            output.frame.dimensions() == input_dims,
            "Fused output keeps input dimensions",
            "hdr"
        );

        output.diagnostics.processing_time_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "Fusion complete in {}ms, histogram {:?}",
            output.diagnostics.processing_time_ms,
            output.histogram
        );
        Ok(output)
    }

    /// Dynamic range optimisation of one frame
    pub fn process_dro(&self, frame: FrameBuffer, options: &HdrOptions) -> Result<FusionOutput> {
        self.process(vec![frame], &CaptureMetadata::default(), options)
    }

    fn process_single(&self, frame: FrameBuffer, options: &HdrOptions) -> Result<FusionOutput> {
        let diagnostics = FusionDiagnostics {
            offsets: vec![AlignmentOffset::ZERO],
            confident: vec![true],
            sharp_index: 0,
            sample_size: 1,
            processing_time_ms: 0,
        };

        if options.is_identity() {
            log::debug!("DRO with identity settings, returning input unchanged");
            return Ok(FusionOutput {
                histogram: analyze(&frame),
                frame,
                diagnostics,
            });
        }

        log::info!(
            "DRO on {}x{} ({:?}, tonemap {})",
            frame.width,
            frame.height,
            options.dro,
            options.tonemap.name()
        );

        let radiance = dro::dro_radiance(&frame, options.dro)?;
        let mut levels = tonemap_levels(&radiance, options.tonemap)?;
        drop(radiance);
        enhance_levels(
            &mut levels,
            options.alpha,
            options.n_tiles,
            options.preserve_blacks,
        )?;
        let output = levels.quantize(frame.format, Some(&frame))?;
        drop(frame);

        Ok(FusionOutput {
            histogram: analyze(&output),
            frame: output,
            diagnostics,
        })
    }

    fn process_bracket(
        &self,
        frames: Vec<FrameBuffer>,
        metadata: &CaptureMetadata,
        options: &HdrOptions,
    ) -> Result<FusionOutput> {
        let n = frames.len();
        log::info!(
            "HDR fusion of {} frames at {}x{} (iso {}, tonemap {})",
            n,
            frames[0].width,
            frames[0].height,
            metadata.iso,
            options.tonemap.name()
        );

        let mut order: Vec<usize> = (0..n).collect();
        if !options.assume_sorted {
            let means: Vec<f32> = frames.iter().map(FrameBuffer::mean_luma).collect();
            order.sort_by(|&a, &b| means[a].total_cmp(&means[b]));
            log::debug!("Exposure order by brightness: {:?}", order);
        }
        let mut slots: Vec<Option<FrameBuffer>> = frames.into_iter().map(Some).collect();
        let frames: Vec<FrameBuffer> = order.iter().filter_map(|&i| slots[i].take()).collect();

        let base = (n - 1) / 2;
        let alignments = self.aligner.align_to_reference(&frames, base)?;
        for (i, result) in alignments.iter().enumerate() {
            if !result.confident {
                log::warn!("Frame {} alignment not confident, using zero offset", order[i]);
            }
        }
        let offsets: Vec<AlignmentOffset> =
            alignments.iter().map(|r| r.accepted_offset()).collect();

        let planes = frames
            .par_iter()
            .map(|frame| LumaPlane::from_frame(frame, 1))
            .collect::<Result<Vec<_>>>()?;

        let threshold = self.ghost.noise_threshold(metadata.iso);
        let mut responses = Vec::with_capacity(n);
        let mut masks = Vec::with_capacity(n);
        for i in 0..n {
            if i == base {
                responses.push(ExposureResponse::IDENTITY);
                masks.push(None);
                continue;
            }
            let response = ExposureResponse::fit(&planes[base], &planes[i], offsets[i]);
            let mapped = response.map_plane(&planes[i]);
            let mask = GhostMask::detect(&planes[base], &mapped, offsets[i], threshold, &self.ghost)?;
            responses.push(response);
            masks.push(Some(mask));
        }
        drop(planes);

        let mut radiance = merge_exposures(&frames, base, &offsets, &responses, &masks)?;
        radiance.dither();
        let mut levels = tonemap_levels(&radiance, options.tonemap)?;
        drop(radiance);

        enhance_levels(
            &mut levels,
            options.alpha,
            options.n_tiles,
            options.preserve_blacks,
        )?;
        let output = levels.quantize(frames[base].format, Some(&frames[base]))?;
        drop(frames);

        let mut reported = vec![AlignmentOffset::ZERO; n];
        let mut confident = vec![true; n];
        for (k, &original) in order.iter().enumerate() {
            reported[original] = offsets[k];
            confident[original] = alignments[k].confident;
        }

        Ok(FusionOutput {
            histogram: analyze(&output),
            frame: output,
            diagnostics: FusionDiagnostics {
                offsets: reported,
                confident,
                sharp_index: order[base],
                sample_size: 1,
                processing_time_ms: 0,
            },
        })
    }
}

fn validate_frames(frames: &[FrameBuffer]) -> Result<()> {
    let Some(first) = frames.first() else {
        return Err(ProcessorError::EmptyInput);
    };
    for frame in frames {
        frame.check()?;
        if frame.dimensions() != first.dimensions() {
            return Err(ProcessorError::DimensionMismatch {
                expected: first.dimensions(),
                got: frame.dimensions(),
            });
        }
        if frame.format != first.format {
            return Err(ProcessorError::FormatMismatch {
                expected: first.format,
                got: frame.format,
            });
        }
    }
    Ok(())
}

#[inline]
fn well_exposedness(level: f32) -> f32 {
    let d = level - 0.5;
    (-(d * d) / (2.0 * WELL_EXPOSED_SIGMA * WELL_EXPOSED_SIGMA)).exp()
}

/// Weighted blend of aligned exposures into base-frame radiance
fn merge_exposures(
    frames: &[FrameBuffer],
    base: usize,
    offsets: &[AlignmentOffset],
    responses: &[ExposureResponse],
    masks: &[Option<GhostMask>],
) -> Result<RadianceBuffer> {
    let width = frames[base].width as usize;
    let height = frames[base].height as usize;
    let mut radiance = RadianceBuffer::new(width as u32, height as u32)?;

    log::debug!("Merging {} exposures around base {}", frames.len(), base);

    radiance
        .data
        .par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            for x in 0..width {
                let mut sum = [0.0f32; 3];
                let mut total = 0.0f32;

                for (i, frame) in frames.iter().enumerate() {
                    let sx = x as i64 + offsets[i].dx as i64;
                    let sy = y as i64 + offsets[i].dy as i64;
                    if sx < 0 || sy < 0 || sx >= width as i64 || sy >= height as i64 {
                        continue;
                    }
                    if let Some(mask) = &masks[i] {
                        if mask.is_ghost(x, y) {
                            continue;
                        }
                    }

                    let rgb = frame.rgb(sx as usize, sy as usize);
                    let clipped = rgb.iter().any(|&c| c >= CLIPPED_CHANNEL);
                    let mut weight = well_exposedness(luminance(&rgb) / 255.0);
                    if i == base {
                        weight = if clipped {
                            BASE_WEIGHT_FLOOR
                        } else {
                            weight.max(BASE_WEIGHT_FLOOR)
                        };
                    } else if clipped {
                        continue;
                    }

                    for c in 0..3 {
                        let value = responses[i].map(rgb[c] as f32).max(0.0) / 255.0;
                        sum[c] += weight * value;
                    }
                    total += weight;
                }

                let out = &mut row[x * 3..x * 3 + 3];
                if total > 0.0 {
                    for c in 0..3 {
                        out[c] = sum[c] / total;
                    }
                }
            }
        });

    Ok(radiance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_data::{exposure_bracket, textured_frame, uniform_frame};

    #[test]
    fn test_hdr_alpha() {
        let short = 1_000_000_000 / 100;
        let long = 1_000_000_000 / 10;
        assert_eq!(hdr_alpha(ContrastEnhancement::Off, 100, short, 1), 0.5);
        assert_eq!(hdr_alpha(ContrastEnhancement::Off, 100, short, 3), 0.0);
        assert_eq!(hdr_alpha(ContrastEnhancement::Off, ISO_UNKNOWN, short, 3), 0.5);
        assert_eq!(hdr_alpha(ContrastEnhancement::Always, 100, long, 3), 0.5);
        assert_eq!(hdr_alpha(ContrastEnhancement::Smart, 100, short, 3), 0.5);
        assert_eq!(hdr_alpha(ContrastEnhancement::Smart, 100, long, 3), 0.0);
    }

    #[test]
    fn test_options_validation() {
        assert!(HdrOptions::default().validate().is_ok());
        let bad = HdrOptions {
            alpha: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_well_exposedness_peaks_at_mid_grey() {
        assert!((well_exposedness(0.5) - 1.0).abs() < 1e-6);
        assert!(well_exposedness(0.1) < well_exposedness(0.4));
        assert!(well_exposedness(0.95) < 0.1);
    }

    #[test]
    fn test_dither_spreads_one_level_and_keeps_black() {
        let mut frame = uniform_frame(64, 64, 100);
        frame.data[..3].copy_from_slice(&[0, 0, 0]);
        let mut radiance = RadianceBuffer::from_frame(&frame).unwrap();
        radiance.dither();

        assert_eq!(radiance.pixel(0, 0), &[0.0, 0.0, 0.0]);
        let mut distinct = std::collections::BTreeSet::new();
        for px in radiance.data.chunks_exact(3).skip(1) {
            assert_eq!(px[0], px[1]);
            let level = px[0] * 255.0;
            assert!((98.999..101.001).contains(&level), "{}", level);
            distinct.insert(level.round() as i32);
        }
        assert_eq!(distinct.into_iter().collect::<Vec<_>>(), vec![99, 100, 101]);
    }

    #[test]
    fn test_level_buffer_quantize_keeps_alpha() {
        let source = FrameBuffer::new(vec![0, 0, 0, 7, 0, 0, 0, 9], 2, 1, PixelFormat::Rgba8);
        let levels = LevelBuffer {
            width: 2,
            height: 1,
            data: vec![10.4, 10.6, -3.0, 254.5, 300.0, 0.0],
        };
        let frame = levels.quantize(PixelFormat::Rgba8, Some(&source)).unwrap();
        assert_eq!(frame.data, vec![10, 11, 0, 7, 255, 255, 0, 9]);

        let rgb = levels.quantize(PixelFormat::Rgb8, None).unwrap();
        assert_eq!(rgb.data, vec![10, 11, 0, 255, 255, 0]);
    }

    #[test]
    fn test_bracket_of_identical_frames_keeps_scene() {
        let frame = uniform_frame(32, 32, 128);
        let engine = FusionEngine::with_defaults().unwrap();
        let options = HdrOptions {
            alpha: 0.0,
            tonemap: TonemapAlgorithm::Clamp,
            ..Default::default()
        };
        let output = engine
            .process(vec![frame.clone(), frame.clone(), frame], &CaptureMetadata::default(), &options)
            .unwrap();
        // dither moves a level by at most one
        for c in output.frame.rgb(10, 10) {
            assert!((127..=129).contains(&c), "{}", c);
        }
        assert_eq!(output.diagnostics.sharp_index, 1);
    }

    #[test]
    fn test_unsorted_bracket_reports_original_order() {
        let base = textured_frame(64, 48, 11);
        let bracket = exposure_bracket(&base, &[0.5, 1.0, 2.0]);
        let shuffled = vec![bracket[2].clone(), bracket[0].clone(), bracket[1].clone()];
        let engine = FusionEngine::with_defaults().unwrap();
        let options = HdrOptions {
            assume_sorted: false,
            ..Default::default()
        };
        let output = engine
            .process(shuffled, &CaptureMetadata::default(), &options)
            .unwrap();
        // middle exposure was passed last
        assert_eq!(output.diagnostics.sharp_index, 2);
        assert_eq!(output.diagnostics.offsets.len(), 3);
    }
}
