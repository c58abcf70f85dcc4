//! Frame projection for panorama stitching
//!
//! Cylindrical projection turns a horizontal pan into a pure translation,
//! so consecutive frames can be aligned and pasted with integer offsets.

use crate::align::pyramid::LumaPlane;
use crate::dither;
use crate::errors::{try_buffer, Result};
use crate::types::FrameBuffer;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Projection {
    /// Wrap frames onto a cylinder around the camera
    #[default]
    Cylindrical,
    /// Paste frames unwarped
    Planar,
}

/// Focal length in pixels for a frame `extent` pixels wide spanning
/// `angle_deg` degrees
pub fn focal_length(extent: f32, angle_deg: f32) -> f32 {
    let half = (angle_deg.to_radians() * 0.5).tan();
    if half > 1e-6 {
        extent * 0.5 / half
    } else {
        extent
    }
}

/// Frame in projected coordinates
///
/// Pixels the source frame does not reach are marked uncovered and hold
/// zero.
#[derive(Debug, Clone)]
pub struct ProjectedFrame {
    pub width: usize,
    pub height: usize,
    pub rgb: Vec<f32>,
    pub coverage: Vec<bool>,
}

impl ProjectedFrame {
    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> &[f32] {
        let idx = (y * self.width + x) * 3;
        &self.rgb[idx..idx + 3]
    }

    #[inline]
    pub fn covered(&self, x: usize, y: usize) -> bool {
        self.coverage[y * self.width + x]
    }

    pub fn luma(&self) -> LumaPlane {
        let data = self
            .rgb
            .chunks_exact(3)
            .map(|px| 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2])
            .collect();
        LumaPlane::new(self.width, self.height, data)
    }

    /// Luma for matching: uncovered pixels repeat the nearest covered pixel
    /// of their row, so projection borders carry no structure
    pub fn match_plane(&self) -> LumaPlane {
        let mut plane = self.luma();
        for y in 0..self.height {
            let row = &self.coverage[y * self.width..(y + 1) * self.width];
            let (Some(first), Some(last)) = (
                row.iter().position(|&c| c),
                row.iter().rposition(|&c| c),
            ) else {
                continue;
            };
            let base = y * self.width;
            let left = plane.data[base + first];
            let right = plane.data[base + last];
            for x in 0..first {
                plane.data[base + x] = left;
            }
            for x in (last + 1)..self.width {
                plane.data[base + x] = right;
            }
        }
        plane
    }

    /// Multiply covered pixels by `gain`, dithering by one level first so a
    /// gain above one leaves no empty levels
    pub fn scale_brightness(&mut self, gain: f32) {
        let width = self.width;
        let coverage = &self.coverage;
        self.rgb
            .par_chunks_mut(3)
            .enumerate()
            .for_each(|(i, px)| {
                if !coverage[i] {
                    return;
                }
                let d = dither::triangular(i % width, i / width);
                for v in px.iter_mut() {
                    if *v > 0.0 {
                        *v = ((*v + d).max(0.0) * gain).min(255.0);
                    }
                }
            });
    }
}

/// Bilinear sample; `None` outside the frame
#[inline]
fn bilinear(frame: &FrameBuffer, x: f32, y: f32) -> Option<[f32; 3]> {
    let max_x = frame.width as f32 - 1.0;
    let max_y = frame.height as f32 - 1.0;
    if !(x >= -0.5 && y >= -0.5 && x <= max_x + 0.5 && y <= max_y + 0.5) {
        return None;
    }
    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(frame.width as usize - 1);
    let y1 = (y0 + 1).min(frame.height as usize - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = frame.rgb(x0, y0);
    let p10 = frame.rgb(x1, y0);
    let p01 = frame.rgb(x0, y1);
    let p11 = frame.rgb(x1, y1);
    let mut out = [0.0f32; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = top * (1.0 - fy) + bottom * fy;
    }
    Some(out)
}

/// Project `frame`, reducing it by `downscale` first
pub fn project_frame(
    frame: &FrameBuffer,
    projection: Projection,
    camera_angle_x_deg: f32,
    downscale: u32,
) -> Result<ProjectedFrame> {
    frame.check()?;
    let factor = downscale.max(1) as f32;
    let width = (frame.width / downscale.max(1)).max(1) as usize;
    let height = (frame.height / downscale.max(1)).max(1) as usize;
    let focal = focal_length(width as f32, camera_angle_x_deg);
    let cx = (width as f32 - 1.0) * 0.5;
    let cy = (height as f32 - 1.0) * 0.5;

    let mut rgb = try_buffer(width * height * 3, 0.0f32, "projected frame")?;
    let mut coverage = try_buffer(width * height, false, "projection coverage")?;

    let to_source = |p: f32| (p + 0.5) * factor - 0.5;

    rgb.par_chunks_mut(width * 3)
        .zip(coverage.par_chunks_mut(width))
        .enumerate()
        .for_each(|(v, (row, cover))| {
            for u in 0..width {
                let (px, py) = match projection {
                    Projection::Planar => (u as f32, v as f32),
                    Projection::Cylindrical => {
                        let theta = (u as f32 - cx) / focal;
                        let px = focal * theta.tan() + cx;
                        let py = (v as f32 - cy) / theta.cos() + cy;
                        (px, py)
                    }
                };
                if let Some(sample) = bilinear(frame, to_source(px), to_source(py)) {
                    row[u * 3..u * 3 + 3].copy_from_slice(&sample);
                    cover[u] = true;
                }
            }
        });

    Ok(ProjectedFrame {
        width,
        height,
        rgb,
        coverage,
    })
}
