//! Mosaic accumulation surface
//!
//! Holds a feather-weighted RGB sum and the matching weight map. The canvas
//! starts empty and grows in any direction as frames are painted.

use super::crop::CropRect;
use super::projection::ProjectedFrame;
use crate::errors::{try_buffer, Result};
use crate::types::{FrameBuffer, PixelFormat};
use rayon::prelude::*;

/// Extra room added whenever the canvas has to grow
const GROWTH_MARGIN: i64 = 64;

#[derive(Debug, Default)]
pub struct MosaicCanvas {
    /// Mosaic coordinate of canvas pixel `(0, 0)`
    origin: (i64, i64),
    width: usize,
    height: usize,
    sum: Vec<f32>,
    weight: Vec<f32>,
}

impl MosaicCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn origin(&self) -> (i64, i64) {
        self.origin
    }

    /// Make room for the mosaic rectangle `[x0, x1) x [y0, y1)`
    fn ensure(&mut self, x0: i64, y0: i64, x1: i64, y1: i64) -> Result<()> {
        let (ox, oy) = self.origin;
        let fits = self.width > 0
            && x0 >= ox
            && y0 >= oy
            && x1 <= ox + self.width as i64
            && y1 <= oy + self.height as i64;
        if fits {
            return Ok(());
        }

        let (nx0, ny0, nx1, ny1) = if self.width == 0 {
            (x0, y0, x1, y1)
        } else {
            (
                if x0 < ox { x0 - GROWTH_MARGIN } else { ox },
                if y0 < oy { y0 - GROWTH_MARGIN } else { oy },
                if x1 > ox + self.width as i64 {
                    x1 + GROWTH_MARGIN
                } else {
                    ox + self.width as i64
                },
                if y1 > oy + self.height as i64 {
                    y1 + GROWTH_MARGIN
                } else {
                    oy + self.height as i64
                },
            )
        };

        let new_width = (nx1 - nx0) as usize;
        let new_height = (ny1 - ny0) as usize;
        log::debug!(
            "Growing canvas {}x{} -> {}x{}",
            self.width,
            self.height,
            new_width,
            new_height
        );

        let mut sum = try_buffer(new_width * new_height * 3, 0.0f32, "panorama canvas")?;
        let mut weight = try_buffer(new_width * new_height, 0.0f32, "panorama weights")?;

        let shift_x = (ox - nx0) as usize;
        let shift_y = (oy - ny0) as usize;
        for y in 0..self.height {
            let src = y * self.width;
            let dst = (y + shift_y) * new_width + shift_x;
            weight[dst..dst + self.width].copy_from_slice(&self.weight[src..src + self.width]);
            sum[dst * 3..(dst + self.width) * 3]
                .copy_from_slice(&self.sum[src * 3..(src + self.width) * 3]);
        }

        self.origin = (nx0, ny0);
        self.width = new_width;
        self.height = new_height;
        self.sum = sum;
        self.weight = weight;
        Ok(())
    }

    /// Add a projected frame with its top-left corner at mosaic `position`
    ///
    /// Each pixel is weighted by its distance from the frame centre so seams
    /// cross-fade.
    pub fn paint(&mut self, frame: &ProjectedFrame, position: (i64, i64)) -> Result<()> {
        let (px, py) = position;
        self.ensure(px, py, px + frame.width as i64, py + frame.height as i64)?;

        let canvas_width = self.width;
        let left = (px - self.origin.0) as usize;
        let top = (py - self.origin.1) as usize;
        let cx = (frame.width as f32 - 1.0) * 0.5;
        let cy = (frame.height as f32 - 1.0) * 0.5;

        let rows = top..top + frame.height;
        let sum_rows = &mut self.sum[rows.start * canvas_width * 3..rows.end * canvas_width * 3];
        let weight_rows = &mut self.weight[rows.start * canvas_width..rows.end * canvas_width];

        sum_rows
            .par_chunks_mut(canvas_width * 3)
            .zip(weight_rows.par_chunks_mut(canvas_width))
            .enumerate()
            .for_each(|(v, (sum_row, weight_row))| {
                let wy = 1.0 - (v as f32 - cy).abs() / (cy + 1.0);
                for u in 0..frame.width {
                    if !frame.covered(u, v) {
                        continue;
                    }
                    let wx = 1.0 - (u as f32 - cx).abs() / (cx + 1.0);
                    let w = wx * wy;
                    let dst = left + u;
                    let src = frame.pixel(u, v);
                    for c in 0..3 {
                        sum_row[dst * 3 + c] += w * src[c];
                    }
                    weight_row[dst] += w;
                }
            });

        Ok(())
    }

    pub fn painted_mask(&self) -> Vec<bool> {
        self.weight.iter().map(|&w| w > 0.0).collect()
    }

    /// Blend the canvas inside `rect` to an 8-bit frame; unpainted pixels
    /// are black
    pub fn render(&self, rect: &CropRect, format: PixelFormat) -> Result<FrameBuffer> {
        let bpp = format.bytes_per_pixel();
        let mut data = try_buffer(rect.width * rect.height * bpp, 255u8, "panorama output")?;

        data.par_chunks_mut(rect.width * bpp)
            .enumerate()
            .for_each(|(y, row)| {
                let cy = rect.y + y;
                for x in 0..rect.width {
                    let idx = cy * self.width + rect.x + x;
                    let w = self.weight[idx];
                    let out = &mut row[x * bpp..x * bpp + 3];
                    if w <= 0.0 {
                        out.copy_from_slice(&[0, 0, 0]);
                        continue;
                    }
                    for c in 0..3 {
                        out[c] = (self.sum[idx * 3 + c] / w).round().clamp(0.0, 255.0) as u8;
                    }
                }
            });

        Ok(FrameBuffer::new(
            data,
            rect.width as u32,
            rect.height as u32,
            format,
        ))
    }
}
