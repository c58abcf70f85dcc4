//! Core data types shared by every pipeline stage

use crate::errors::{ProcessorError, Result};
use serde::{Deserialize, Serialize};

/// ISO value meaning "unknown", which selects "always enhance" behaviour
pub const ISO_UNKNOWN: i32 = -1;

/// Interleaved 8-bit pixel layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// In-memory pixel grid
///
/// Stages take frames by value; once a frame has been handed to a stage the
/// caller no longer owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            format,
        }
    }

    /// Like [`FrameBuffer::new`] but rejects a data length that does not
    /// match the dimensions
    pub fn try_new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let frame = Self::new(data, width, height, format);
        frame.check()?;
        Ok(frame)
    }

    /// A frame with every pixel set to `rgb` (alpha 255 for RGBA)
    pub fn filled(width: u32, height: u32, format: PixelFormat, rgb: [u8; 3]) -> Self {
        let bpp = format.bytes_per_pixel();
        let mut data = vec![255u8; width as usize * height as usize * bpp];
        for px in data.chunks_exact_mut(bpp) {
            px[..3].copy_from_slice(&rgb);
        }
        Self::new(data, width, height, format)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.expected_len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Verify the buffer is non-empty and its data length matches
    pub fn check(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ProcessorError::invalid_config(format!(
                "frame has empty dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.data.len() != self.expected_len() {
            return Err(ProcessorError::DataCorruption {
                frame_size: self.data.len(),
                expected_size: self.expected_len(),
            });
        }
        Ok(())
    }

    /// RGB triple at `(x, y)`; caller guarantees bounds
    #[inline]
    pub fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let idx = (y * self.width as usize + x) * self.format.bytes_per_pixel();
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Rec.601 luminance at `(x, y)`
    #[inline]
    pub fn luma_at(&self, x: usize, y: usize) -> f32 {
        luminance(&self.rgb(x, y))
    }

    pub fn mean_luma(&self) -> f32 {
        let bpp = self.format.bytes_per_pixel();
        let count = self.pixel_count().max(1);
        let sum: f64 = self
            .data
            .chunks_exact(bpp)
            .map(|px| luminance(&px[..3]) as f64)
            .sum();
        (sum / count as f64) as f32
    }

    pub fn from_rgb_image(img: image::RgbImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height, PixelFormat::Rgb8)
    }

    pub fn from_rgba_image(img: image::RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height, PixelFormat::Rgba8)
    }

    /// Convert into an `image` buffer; `None` when the data length is wrong
    pub fn into_dynamic_image(self) -> Option<image::DynamicImage> {
        match self.format {
            PixelFormat::Rgb8 => image::RgbImage::from_raw(self.width, self.height, self.data)
                .map(image::DynamicImage::ImageRgb8),
            PixelFormat::Rgba8 => image::RgbaImage::from_raw(self.width, self.height, self.data)
                .map(image::DynamicImage::ImageRgba8),
        }
    }

    /// Drop any alpha channel and convert into an RGB image
    pub fn into_rgb_image(self) -> Option<image::RgbImage> {
        self.into_dynamic_image().map(|img| img.to_rgb8())
    }
}

/// Convert RGB to luminance
#[inline]
pub fn luminance(rgb: &[u8]) -> f32 {
    0.299 * rgb[0] as f32 + 0.587 * rgb[1] as f32 + 0.114 * rgb[2] as f32
}

/// Gyro-derived camera orientation at capture time, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OrientationSample {
    pub yaw_degrees: f32,
    pub pitch_degrees: f32,
    pub roll_degrees: f32,
}

/// Per-frame capture parameters supplied by the camera layer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// ISO sensitivity, [`ISO_UNKNOWN`] when not reported
    pub iso: i32,
    pub exposure_time_ns: i64,
    /// Zoom factor (>= 1.0)
    pub zoom_factor: f32,
    pub orientation: Option<OrientationSample>,
}

impl Default for CaptureMetadata {
    fn default() -> Self {
        Self {
            iso: ISO_UNKNOWN,
            exposure_time_ns: 1_000_000_000 / 30,
            zoom_factor: 1.0,
            orientation: None,
        }
    }
}

impl CaptureMetadata {
    pub fn new(iso: i32, exposure_time_ns: i64, zoom_factor: f32) -> Self {
        Self {
            iso,
            exposure_time_ns,
            zoom_factor,
            orientation: None,
        }
    }

    pub fn with_orientation(mut self, orientation: OrientationSample) -> Self {
        self.orientation = Some(orientation);
        self
    }

    pub fn iso_known(&self) -> bool {
        self.iso != ISO_UNKNOWN
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.zoom_factor.is_finite() && self.zoom_factor >= 1.0) {
            return Err(ProcessorError::invalid_config(format!(
                "zoom factor must be >= 1.0, got {}",
                self.zoom_factor
            )));
        }
        if self.exposure_time_ns < 0 {
            return Err(ProcessorError::invalid_config(
                "exposure time must not be negative",
            ));
        }
        Ok(())
    }
}

/// Integer translation of a frame relative to the reference frame
///
/// Convention: the candidate sampled at `(x + dx, y + dy)` lines up with the
/// reference at `(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AlignmentOffset {
    pub dx: i32,
    pub dy: i32,
}

impl AlignmentOffset {
    pub const ZERO: AlignmentOffset = AlignmentOffset { dx: 0, dy: 0 };

    pub const fn new(dx: i32, dy: i32) -> Self {
        Self { dx, dy }
    }

    pub fn is_zero(&self) -> bool {
        self.dx == 0 && self.dy == 0
    }

    /// Rescale an offset measured at a reduced resolution
    pub fn scaled(&self, factor: i32) -> Self {
        Self::new(self.dx * factor, self.dy * factor)
    }

    pub fn distance_sq(&self, other: &AlignmentOffset) -> i64 {
        let dx = (self.dx - other.dx) as i64;
        let dy = (self.dy - other.dy) as i64;
        dx * dx + dy * dy
    }

    pub fn max_abs_delta(&self, other: &AlignmentOffset) -> i32 {
        (self.dx - other.dx).abs().max((self.dy - other.dy).abs())
    }
}

impl std::ops::Add for AlignmentOffset {
    type Output = AlignmentOffset;

    fn add(self, rhs: AlignmentOffset) -> AlignmentOffset {
        AlignmentOffset::new(self.dx + rhs.dx, self.dy + rhs.dy)
    }
}

impl std::ops::Neg for AlignmentOffset {
    type Output = AlignmentOffset;

    fn neg(self) -> AlignmentOffset {
        AlignmentOffset::new(-self.dx, -self.dy)
    }
}

/// Diagnostics returned alongside every fused output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FusionDiagnostics {
    /// Offset of each input frame relative to the reference frame, expressed
    /// at the processing resolution (multiply by `sample_size` for full
    /// resolution)
    pub offsets: Vec<AlignmentOffset>,

    /// Whether each offset came from a confident alignment
    pub confident: Vec<bool>,

    /// Index of the frame used as alignment base
    pub sharp_index: usize,

    /// Downsample factor between input frames and the processing resolution
    pub sample_size: u32,

    pub processing_time_ms: u64,
}

impl FusionDiagnostics {
    /// Offsets rescaled to full input resolution
    pub fn full_resolution_offsets(&self) -> Vec<AlignmentOffset> {
        self.offsets
            .iter()
            .map(|o| o.scaled(self.sample_size.max(1) as i32))
            .collect()
    }
}
