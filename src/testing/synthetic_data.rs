//! Deterministic synthetic scenes
//!
//! Every generator is a pure function of its arguments, so tests and benches
//! can rebuild the same frames without fixtures on disk.

use crate::align::apply_alignment;
use crate::dither::unit_hash;
use crate::types::{AlignmentOffset, FrameBuffer, PixelFormat};

/// Coarse texture cell, survives several pyramid levels
const COARSE_CELL: f32 = 12.0;
/// Fine texture cell
const FINE_CELL: f32 = 4.0;

/// Bilinearly interpolated lattice noise in [0, 1)
fn value_noise(seed: u64, x: f32, y: f32, cell: f32) -> f32 {
    let gx = x / cell;
    let gy = y / cell;
    let x0 = gx.floor();
    let y0 = gy.floor();
    let fx = gx - x0;
    let fy = gy - y0;
    let (ix, iy) = (x0 as i64, y0 as i64);

    let top = unit_hash(seed, ix, iy) * (1.0 - fx) + unit_hash(seed, ix + 1, iy) * fx;
    let bottom = unit_hash(seed, ix, iy + 1) * (1.0 - fx) + unit_hash(seed, ix + 1, iy + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Scene brightness at a continuous position, in [30, 225]
pub fn scene_value(seed: u64, x: f32, y: f32) -> f32 {
    let coarse = value_noise(seed, x, y, COARSE_CELL);
    let fine = value_noise(seed ^ 0x5555, x, y, FINE_CELL);
    30.0 + 195.0 * (0.7 * coarse + 0.3 * fine)
}

/// Textured RGB frame sampled from the scene with its origin at `(ox, oy)`
pub fn textured_frame_at(width: u32, height: u32, seed: u64, ox: i32, oy: i32) -> FrameBuffer {
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let v = scene_value(seed, (x + ox) as f32, (y + oy) as f32);
            // mild colour cast so channels differ
            data.push((v * 1.05).min(255.0) as u8);
            data.push(v as u8);
            data.push((v * 0.9) as u8);
        }
    }
    FrameBuffer::new(data, width, height, PixelFormat::Rgb8)
}

pub fn textured_frame(width: u32, height: u32, seed: u64) -> FrameBuffer {
    textured_frame_at(width, height, seed, 0, 0)
}

/// Copy of `frame` whose content is displaced so that the aligner should
/// report `(dx, dy)` against the original
pub fn shifted_frame(frame: &FrameBuffer, dx: i32, dy: i32) -> FrameBuffer {
    match apply_alignment(frame, AlignmentOffset::new(-dx, -dy)) {
        Ok(shifted) => shifted,
        Err(_) => frame.clone(),
    }
}

pub fn uniform_frame(width: u32, height: u32, value: u8) -> FrameBuffer {
    FrameBuffer::filled(width, height, PixelFormat::Rgb8, [value, value, value])
}

/// Horizontal grey ramp spanning `[low, high]`
pub fn gradient_frame(width: u32, height: u32, low: u8, high: u8) -> FrameBuffer {
    let mut data = Vec::with_capacity(width as usize * height as usize * 3);
    let span = high as f32 - low as f32;
    for _ in 0..height {
        for x in 0..width {
            let t = if width > 1 {
                x as f32 / (width - 1) as f32
            } else {
                0.0
            };
            let v = (low as f32 + span * t).round() as u8;
            data.extend_from_slice(&[v, v, v]);
        }
    }
    FrameBuffer::new(data, width, height, PixelFormat::Rgb8)
}

/// Simulate a bracket by scaling linear brightness with each gain
pub fn exposure_bracket(base: &FrameBuffer, gains: &[f32]) -> Vec<FrameBuffer> {
    gains
        .iter()
        .map(|&gain| {
            let bpp = base.format.bytes_per_pixel();
            let mut data = base.data.clone();
            for px in data.chunks_exact_mut(bpp) {
                for c in px.iter_mut().take(3) {
                    *c = (*c as f32 * gain).round().clamp(0.0, 255.0) as u8;
                }
            }
            FrameBuffer::new(data, base.width, base.height, base.format)
        })
        .collect()
}

/// Add deterministic zero-mean noise of up to `amplitude` levels
pub fn noisy_copy(frame: &FrameBuffer, seed: u64, amplitude: f32) -> FrameBuffer {
    let bpp = frame.format.bytes_per_pixel();
    let mut data = frame.data.clone();
    let width = frame.width as i64;
    for (i, px) in data.chunks_exact_mut(bpp).enumerate() {
        let (x, y) = (i as i64 % width, i as i64 / width);
        for (c, value) in px.iter_mut().take(3).enumerate() {
            let n = (unit_hash(seed.wrapping_add(c as u64), x, y) - 0.5) * 2.0 * amplitude;
            *value = (*value as f32 + n).round().clamp(0.0, 255.0) as u8;
        }
    }
    FrameBuffer::new(data, frame.width, frame.height, frame.format)
}

/// Paste a solid square, simulating a subject that moved between frames
pub fn with_square(frame: &FrameBuffer, x0: u32, y0: u32, size: u32, rgb: [u8; 3]) -> FrameBuffer {
    let mut out = frame.clone();
    let bpp = frame.format.bytes_per_pixel();
    for y in y0..(y0 + size).min(frame.height) {
        for x in x0..(x0 + size).min(frame.width) {
            let idx = (y as usize * frame.width as usize + x as usize) * bpp;
            out.data[idx..idx + 3].copy_from_slice(&rgb);
        }
    }
    out
}

/// Frames panned across one wide scene, `step` pixels apart
///
/// `step > 0` pans left to right.
pub fn panorama_sequence(
    frame_width: u32,
    frame_height: u32,
    count: usize,
    step: i32,
    seed: u64,
) -> Vec<FrameBuffer> {
    (0..count)
        .map(|i| textured_frame_at(frame_width, frame_height, seed, i as i32 * step, 0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generators_are_deterministic() {
        assert_eq!(textured_frame(32, 24, 5), textured_frame(32, 24, 5));
        assert_ne!(textured_frame(32, 24, 5), textured_frame(32, 24, 6));
    }

    #[test]
    fn test_textured_frame_range() {
        let frame = textured_frame(64, 48, 1);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
        assert!(frame.data.iter().all(|&v| v >= 27));
    }

    #[test]
    fn test_textured_frame_at_is_a_window() {
        let wide = textured_frame(64, 16, 3);
        let window = textured_frame_at(32, 16, 3, 10, 0);
        assert_eq!(window.rgb(0, 0), wide.rgb(10, 0));
        assert_eq!(window.rgb(31, 15), wide.rgb(41, 15));
    }

    #[test]
    fn test_gradient_endpoints() {
        let frame = gradient_frame(11, 2, 10, 110);
        assert_eq!(frame.rgb(0, 0), [10, 10, 10]);
        assert_eq!(frame.rgb(10, 1), [110, 110, 110]);
    }

    #[test]
    fn test_exposure_bracket_scales() {
        let base = uniform_frame(4, 4, 100);
        let bracket = exposure_bracket(&base, &[0.5, 1.0, 4.0]);
        assert_eq!(bracket[0].rgb(0, 0), [50, 50, 50]);
        assert_eq!(bracket[1], base);
        assert_eq!(bracket[2].rgb(0, 0), [255, 255, 255]);
    }

    #[test]
    fn test_noise_is_bounded() {
        let base = uniform_frame(16, 16, 128);
        let noisy = noisy_copy(&base, 9, 4.0);
        assert_ne!(noisy, base);
        assert!(noisy.data.iter().all(|&v| (124..=132).contains(&v)));
    }
}
