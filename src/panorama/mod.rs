//! Panorama stitching
//!
//! Frames captured while panning are projected, placed relative to the
//! previous frame and painted onto a growing mosaic canvas:
//!
//! 1. Project the frame (cylindrical by default)
//! 2. Place it: gyro-seeded search when orientation samples exist, a wide
//!    vision search around the nominal step otherwise, and finally the gyro
//!    prediction or the nominal step when nothing matches
//! 3. Match exposure against the previous frame
//! 4. Feather-blend onto the canvas
//!
//! `finish` crops the mosaic so no edge keeps more than a small share of
//! unpainted pixels. Only the previous projected frame is kept between
//! calls.

pub mod canvas;
pub mod crop;
pub mod projection;

use crate::align::{AlignConfig, Aligner, PreparedFrame};
use crate::errors::{ProcessorError, Result};
use crate::histogram::{analyze, HistogramStats};
use crate::types::{AlignmentOffset, FrameBuffer, OrientationSample, PixelFormat};
use canvas::MosaicCanvas;
use crop::{crop_to_painted, edge_unpainted_fraction, painted_bounds, CropRect, Edge};
use projection::{focal_length, project_frame, ProjectedFrame};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub use projection::Projection;

/// Exposure gain bounds between neighbouring frames
const MIN_EXPOSURE_GAIN: f32 = 0.5;
const MAX_EXPOSURE_GAIN: f32 = 2.0;

/// Smallest search radius used around a gyro prediction (pixels)
const MIN_GYRO_RADIUS: u32 = 2;

/// Smallest vision search radius (pixels)
const MIN_VISION_RADIUS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PanDirection {
    #[default]
    LeftToRight,
    RightToLeft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanoramaOptions {
    /// Frames captured per horizontal field of view
    pub pics_per_screen: f32,
    pub camera_angle_x_deg: f32,
    pub camera_angle_y_deg: f32,
    /// Largest gyro/vision disagreement still searched around the gyro
    /// prediction
    pub gyro_tolerance_deg: f32,
    pub crop: bool,
    pub projection: Projection,
    pub direction: PanDirection,
    pub exposure_compensation: bool,
    /// Largest unpainted share allowed on any output edge
    pub max_border_black: f32,
    /// Frames taller than this are downscaled before stitching
    pub max_height: u32,
}

impl Default for PanoramaOptions {
    fn default() -> Self {
        Self {
            pics_per_screen: 3.33,
            camera_angle_x_deg: 66.0,
            camera_angle_y_deg: 50.0,
            gyro_tolerance_deg: 2.0,
            crop: true,
            projection: Projection::Cylindrical,
            direction: PanDirection::LeftToRight,
            exposure_compensation: true,
            max_border_black: 0.01,
            max_height: 2080,
        }
    }
}

impl PanoramaOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.pics_per_screen.is_finite() && self.pics_per_screen >= 1.0) {
            return Err(ProcessorError::invalid_config(
                "pics_per_screen must be at least 1",
            ));
        }
        for (name, angle) in [
            ("camera_angle_x_deg", self.camera_angle_x_deg),
            ("camera_angle_y_deg", self.camera_angle_y_deg),
        ] {
            if !(angle > 0.0 && angle < 180.0) {
                return Err(ProcessorError::invalid_config(format!(
                    "{} must be in (0, 180), got {}",
                    name, angle
                )));
            }
        }
        if !(self.gyro_tolerance_deg >= 0.0) {
            return Err(ProcessorError::invalid_config(
                "gyro_tolerance_deg must not be negative",
            ));
        }
        if !(0.0..1.0).contains(&self.max_border_black) {
            return Err(ProcessorError::invalid_config(
                "max_border_black must be in [0, 1)",
            ));
        }
        if self.max_height == 0 {
            return Err(ProcessorError::invalid_config("max_height must be positive"));
        }
        Ok(())
    }
}

/// How a frame's position was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementSource {
    /// First frame, defines the mosaic origin
    First,
    /// Image match within the gyro tolerance
    GyroSeeded,
    /// Image match around the nominal step
    Vision,
    /// Gyro prediction, no usable image match
    Gyro,
    /// Nominal step from pics-per-screen, nothing else available
    Nominal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FramePlacement {
    pub index: usize,
    /// Displacement from the previous frame in projected pixels
    pub offset: AlignmentOffset,
    /// Mosaic position of the projected frame's top-left corner
    pub position: (i64, i64),
    pub source: PlacementSource,
    pub confident: bool,
}

#[derive(Debug, Clone)]
pub struct PanoramaOutput {
    pub frame: FrameBuffer,
    pub histogram: Option<HistogramStats>,
    pub placements: Vec<FramePlacement>,
}

/// Data kept from the previously added frame
struct PreviousFrame {
    prepared: PreparedFrame,
    projected: ProjectedFrame,
    position: (i64, i64),
    orientation: Option<OrientationSample>,
}

/// Per-sequence geometry fixed by the first frame
struct Geometry {
    input_dims: (u32, u32),
    format: PixelFormat,
    downscale: u32,
    focal_x: f32,
    focal_y: f32,
    nominal: AlignmentOffset,
}

struct StitchState {
    geometry: Option<Geometry>,
    canvas: MosaicCanvas,
    previous: Option<PreviousFrame>,
    placements: Vec<FramePlacement>,
}

pub struct PanoramaStitcher {
    options: PanoramaOptions,
    aligner: Aligner,
    state: Option<StitchState>,
    started: Instant,
}

impl PanoramaStitcher {
    pub fn new(options: PanoramaOptions, align: AlignConfig) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            aligner: Aligner::new(align)?,
            state: Some(StitchState {
                geometry: None,
                canvas: MosaicCanvas::new(),
                previous: None,
                placements: Vec::new(),
            }),
            started: Instant::now(),
        })
    }

    pub fn options(&self) -> &PanoramaOptions {
        &self.options
    }

    pub fn frame_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.placements.len())
    }

    /// Place and paint the next frame
    pub fn add_frame(
        &mut self,
        frame: FrameBuffer,
        orientation: Option<OrientationSample>,
    ) -> Result<FramePlacement> {
        let Some(state) = self.state.as_mut() else {
            return Err(ProcessorError::consumed("panorama stitcher"));
        };
        frame.check()?;

        if state.geometry.is_none() {
            state.geometry = Some(Geometry::new(&frame, &self.options));
        }
        let Some(geometry) = state.geometry.as_ref() else {
            return Err(ProcessorError::EmptyInput);
        };
        if frame.dimensions() != geometry.input_dims {
            return Err(ProcessorError::DimensionMismatch {
                expected: geometry.input_dims,
                got: frame.dimensions(),
            });
        }
        if frame.format != geometry.format {
            return Err(ProcessorError::FormatMismatch {
                expected: geometry.format,
                got: frame.format,
            });
        }

        let index = state.placements.len();
        let mut projected = project_frame(
            &frame,
            self.options.projection,
            self.options.camera_angle_x_deg,
            geometry.downscale,
        )?;
        drop(frame);
        let prepared = self.aligner.prepare_plane(projected.match_plane());

        let placement = match &state.previous {
            None => FramePlacement {
                index,
                offset: AlignmentOffset::ZERO,
                position: (0, 0),
                source: PlacementSource::First,
                confident: true,
            },
            Some(previous) => {
                let (offset, source, confident) =
                    place(&self.aligner, &self.options, geometry, previous, &prepared, orientation)?;
                FramePlacement {
                    index,
                    offset,
                    position: (
                        previous.position.0 + offset.dx as i64,
                        previous.position.1 + offset.dy as i64,
                    ),
                    source,
                    confident,
                }
            }
        };

        if self.options.exposure_compensation {
            if let Some(previous) = &state.previous {
                let gain = exposure_gain(previous, &projected, placement.offset);
                if (gain - 1.0).abs() > 1e-3 {
                    log::debug!("Frame {} exposure gain {:.3}", index, gain);
                    projected.scale_brightness(gain);
                }
            }
        }

        state.canvas.paint(&projected, placement.position)?;

        log::info!(
            "Panorama frame {} placed at ({}, {}) via {:?}",
            index,
            placement.position.0,
            placement.position.1,
            placement.source
        );

        state.previous = Some(PreviousFrame {
            prepared,
            projected,
            position: placement.position,
            orientation,
        });
        state.placements.push(placement);
        Ok(placement)
    }

    /// Blend, crop and return the mosaic; the stitcher cannot be used
    /// afterwards
    pub fn finish(&mut self) -> Result<PanoramaOutput> {
        let Some(state) = self.state.take() else {
            return Err(ProcessorError::consumed("panorama stitcher"));
        };
        let Some(geometry) = state.geometry else {
            return Err(ProcessorError::EmptyInput);
        };

        let (width, height) = state.canvas.dimensions();
        let painted = state.canvas.painted_mask();
        let rect = if self.options.crop {
            crop_to_painted(&painted, width, height, self.options.max_border_black)
        } else {
            painted_bounds(&painted, width, height)
        }
        .ok_or(ProcessorError::EmptyInput)?;

        if self.options.crop {
            let worst = worst_edge(&painted, width, &rect);
            crate::assert_invariant!(
                worst <= self.options.max_border_black || rect.width == 1 || rect.height == 1,
                "Panorama edges stay within the unpainted tolerance",
                "panorama"
            );
        }

        let frame = state.canvas.render(&rect, geometry.format)?;
        log::info!(
            "Panorama of {} frames: {}x{} in {}ms",
            state.placements.len(),
            frame.width,
            frame.height,
            self.started.elapsed().as_millis()
        );

        Ok(PanoramaOutput {
            histogram: analyze(&frame),
            frame,
            placements: state.placements,
        })
    }
}

impl Geometry {
    fn new(frame: &FrameBuffer, options: &PanoramaOptions) -> Self {
        let downscale = frame.height.div_ceil(options.max_height).max(1);
        let width = (frame.width / downscale).max(1) as f32;
        let height = (frame.height / downscale).max(1) as f32;
        let focal_x = focal_length(width, options.camera_angle_x_deg);
        let focal_y = focal_length(height, options.camera_angle_y_deg);

        let step = match options.projection {
            Projection::Cylindrical => {
                focal_x * options.camera_angle_x_deg.to_radians() / options.pics_per_screen
            }
            Projection::Planar => width / options.pics_per_screen,
        };
        let step = step.round() as i32;
        let nominal = match options.direction {
            PanDirection::LeftToRight => AlignmentOffset::new(step, 0),
            PanDirection::RightToLeft => AlignmentOffset::new(-step, 0),
        };

        log::debug!(
            "Panorama geometry: downscale {}, focal {:.1}x{:.1}, nominal step {}",
            downscale,
            focal_x,
            focal_y,
            step
        );

        Self {
            input_dims: frame.dimensions(),
            format: frame.format,
            downscale,
            focal_x,
            focal_y,
            nominal,
        }
    }

    /// Displacement implied by the orientation change between two frames
    ///
    /// Yaw grows to the right and pitch grows upward.
    fn gyro_offset(&self, previous: &OrientationSample, current: &OrientationSample) -> AlignmentOffset {
        let mut yaw = current.yaw_degrees - previous.yaw_degrees;
        if yaw > 180.0 {
            yaw -= 360.0;
        } else if yaw < -180.0 {
            yaw += 360.0;
        }
        let pitch = current.pitch_degrees - previous.pitch_degrees;
        AlignmentOffset::new(
            (yaw.to_radians() * self.focal_x).round() as i32,
            (-pitch.to_radians() * self.focal_y).round() as i32,
        )
    }
}

/// Choose the displacement of the current frame from the previous one
///
/// Aligner offsets point from reference to candidate content, so the
/// frame's displacement is their negation.
fn place(
    aligner: &Aligner,
    options: &PanoramaOptions,
    geometry: &Geometry,
    previous: &PreviousFrame,
    current: &PreparedFrame,
    orientation: Option<OrientationSample>,
) -> Result<(AlignmentOffset, PlacementSource, bool)> {
    let gyro = match (previous.orientation.as_ref(), orientation.as_ref()) {
        (Some(p), Some(c)) => Some(geometry.gyro_offset(p, c)),
        _ => None,
    };

    if let Some(predicted) = gyro {
        let radius = ((options.gyro_tolerance_deg.to_radians() * geometry.focal_x).round() as u32)
            .max(MIN_GYRO_RADIUS);
        let result = aligner.align_prepared(&previous.prepared, current, -predicted, Some(radius))?;
        if result.confident {
            return Ok((-result.offset, PlacementSource::GyroSeeded, true));
        }
        log::debug!("Gyro-seeded match not confident, trying vision search");
    }

    let radius = ((geometry.nominal.dx.unsigned_abs()) / 2).max(MIN_VISION_RADIUS);
    let result = aligner.align_prepared(&previous.prepared, current, -geometry.nominal, Some(radius))?;
    if result.confident {
        return Ok((-result.offset, PlacementSource::Vision, true));
    }

    match gyro {
        Some(predicted) => {
            log::warn!("No confident image match, using gyro prediction");
            Ok((predicted, PlacementSource::Gyro, false))
        }
        None => {
            log::warn!("No confident image match, using nominal step");
            Ok((geometry.nominal, PlacementSource::Nominal, false))
        }
    }
}

/// Gain bringing `current` to the brightness of `previous` over their overlap
fn exposure_gain(previous: &PreviousFrame, current: &ProjectedFrame, offset: AlignmentOffset) -> f32 {
    let prev = &previous.projected;
    let mut sum_prev = 0.0f64;
    let mut sum_cur = 0.0f64;
    let step = 2;
    for y in (0..current.height).step_by(step) {
        let py = y as i64 + offset.dy as i64;
        if py < 0 || py >= prev.height as i64 {
            continue;
        }
        for x in (0..current.width).step_by(step) {
            let px = x as i64 + offset.dx as i64;
            if px < 0 || px >= prev.width as i64 {
                continue;
            }
            let (px, py) = (px as usize, py as usize);
            if !current.covered(x, y) || !prev.covered(px, py) {
                continue;
            }
            let a = prev.pixel(px, py);
            let b = current.pixel(x, y);
            sum_prev += (a[0] + a[1] + a[2]) as f64;
            sum_cur += (b[0] + b[1] + b[2]) as f64;
        }
    }
    if sum_cur <= 1.0 || sum_prev <= 1.0 {
        return 1.0;
    }
    ((sum_prev / sum_cur) as f32).clamp(MIN_EXPOSURE_GAIN, MAX_EXPOSURE_GAIN)
}

fn worst_edge(painted: &[bool], stride: usize, rect: &CropRect) -> f32 {
    Edge::ALL
        .iter()
        .map(|&edge| edge_unpainted_fraction(painted, stride, rect, edge))
        .fold(0.0, f32::max)
}

/// Stitch a complete sequence in one call
///
/// `orientations`, when given, must hold one sample per frame.
pub fn stitch(
    frames: Vec<FrameBuffer>,
    orientations: Option<&[OrientationSample]>,
    options: &PanoramaOptions,
    align: &AlignConfig,
) -> Result<PanoramaOutput> {
    if frames.is_empty() {
        return Err(ProcessorError::EmptyInput);
    }
    if let Some(samples) = orientations {
        if samples.len() != frames.len() {
            return Err(ProcessorError::invalid_config(format!(
                "{} orientation samples for {} frames",
                samples.len(),
                frames.len()
            )));
        }
    }

    log::info!("Stitching panorama of {} frames", frames.len());
    let mut stitcher = PanoramaStitcher::new(options.clone(), align.clone())?;
    for (i, frame) in frames.into_iter().enumerate() {
        let orientation = orientations.map(|samples| samples[i]);
        stitcher.add_frame(frame, orientation)?;
    }
    stitcher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_data::{panorama_sequence, uniform_frame};

    fn planar_options(pics_per_screen: f32) -> PanoramaOptions {
        PanoramaOptions {
            pics_per_screen,
            projection: Projection::Planar,
            ..Default::default()
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(PanoramaOptions::default().validate().is_ok());
        let bad = PanoramaOptions {
            pics_per_screen: 0.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_nominal_step() {
        let frame = uniform_frame(120, 90, 10);
        let geometry = Geometry::new(&frame, &planar_options(4.0));
        assert_eq!(geometry.nominal, AlignmentOffset::new(30, 0));

        let rtl = PanoramaOptions {
            direction: PanDirection::RightToLeft,
            ..planar_options(4.0)
        };
        assert_eq!(Geometry::new(&frame, &rtl).nominal, AlignmentOffset::new(-30, 0));
    }

    #[test]
    fn test_downscale_for_tall_frames() {
        let frame = uniform_frame(64, 64, 10);
        let options = PanoramaOptions {
            max_height: 30,
            ..Default::default()
        };
        assert_eq!(Geometry::new(&frame, &options).downscale, 3);
    }

    #[test]
    fn test_gyro_offset_sign() {
        let frame = uniform_frame(120, 90, 10);
        let geometry = Geometry::new(&frame, &planar_options(4.0));
        let a = OrientationSample::default();
        let b = OrientationSample {
            yaw_degrees: 10.0,
            ..Default::default()
        };
        let offset = geometry.gyro_offset(&a, &b);
        assert!(offset.dx > 0);
        assert_eq!(offset.dy, 0);
    }

    #[test]
    fn test_planar_sequence_recovers_steps() {
        let frames = panorama_sequence(120, 80, 4, 36, 21);
        let output = stitch(frames, None, &planar_options(120.0 / 36.0), &AlignConfig::default())
            .unwrap();
        for placement in &output.placements[1..] {
            assert_eq!(placement.source, PlacementSource::Vision);
            assert_eq!(placement.offset, AlignmentOffset::new(36, 0));
        }
        assert_eq!(output.frame.width, 120 + 3 * 36);
        assert_eq!(output.frame.height, 80);
    }

    #[test]
    fn test_finish_twice_is_rejected() {
        let mut stitcher =
            PanoramaStitcher::new(PanoramaOptions::default(), AlignConfig::default()).unwrap();
        stitcher.add_frame(uniform_frame(64, 48, 200), None).unwrap();
        assert!(stitcher.finish().is_ok());
        assert!(matches!(
            stitcher.finish(),
            Err(ProcessorError::StateConsumed(_))
        ));
        assert!(matches!(
            stitcher.add_frame(uniform_frame(64, 48, 200), None),
            Err(ProcessorError::StateConsumed(_))
        ));
    }

    #[test]
    fn test_finish_without_frames_is_empty_input() {
        let mut stitcher =
            PanoramaStitcher::new(PanoramaOptions::default(), AlignConfig::default()).unwrap();
        assert!(matches!(stitcher.finish(), Err(ProcessorError::EmptyInput)));
    }
}
