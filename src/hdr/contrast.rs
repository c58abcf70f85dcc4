//! Local contrast enhancement
//!
//! Clip-limited adaptive histogram equalisation on a grid of tiles. Each
//! tile gets its own brightness lookup table; pixels interpolate bilinearly
//! between the four nearest tile centres so tile seams never show. The
//! equalised brightness is blended with the original by `alpha` and applied
//! by scaling RGB, so hue is kept.

use super::LevelBuffer;
use crate::errors::{ProcessorError, Result};
use crate::types::FrameBuffer;
use rayon::prelude::*;

/// Histogram bins may hold at most this multiple of the uniform share
const CLIP_LIMIT: f32 = 3.0;

/// Values below this are lifted at most proportionally to their level
const BLACK_LEVEL: f32 = 32.0;

const MAX_TILES: u32 = 32;

type Lut = [f32; 256];

/// Tiles per side accepted by the contrast stage
pub(crate) fn check_tiles(n_tiles: u32) -> Result<()> {
    if !(1..=MAX_TILES).contains(&n_tiles) {
        return Err(ProcessorError::invalid_config(format!(
            "n_tiles must be between 1 and {}, got {}",
            MAX_TILES, n_tiles
        )));
    }
    Ok(())
}

#[inline]
fn pixel_level(px: &[f32]) -> f32 {
    (px[0] + px[1] + px[2]) / 3.0
}

fn tile_lut(levels: &LevelBuffer, x0: usize, y0: usize, x1: usize, y1: usize) -> Lut {
    let width = levels.width as usize;
    let mut hist = [0f32; 256];
    let mut count = 0usize;
    for y in y0..y1 {
        for x in x0..x1 {
            let idx = (y * width + x) * 3;
            let bin = pixel_level(&levels.data[idx..idx + 3]).round().clamp(0.0, 255.0) as usize;
            hist[bin] += 1.0;
            count += 1;
        }
    }

    let mut lut = [0f32; 256];
    if count == 0 {
        for (i, v) in lut.iter_mut().enumerate() {
            *v = i as f32;
        }
        return lut;
    }

    let limit = (CLIP_LIMIT * count as f32 / 256.0).max(1.0);
    let mut excess = 0.0;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256.0;

    let mut cumulative = 0.0;
    for (bin, v) in hist.iter().zip(lut.iter_mut()) {
        cumulative += bin + share;
        *v = 255.0 * cumulative / count as f32;
    }
    lut
}

/// LUT value at a fractional level, linear between bins
#[inline]
fn lookup(lut: &Lut, level: f32) -> f32 {
    let level = level.clamp(0.0, 255.0);
    let lo = level.floor() as usize;
    if lo >= 255 {
        return lut[255];
    }
    let t = level - lo as f32;
    lut[lo] * (1.0 - t) + lut[lo + 1] * t
}

/// Tile index and weight of the lower neighbour for a coordinate
#[inline]
fn tile_coord(pos: usize, tile_size: f32, tiles: usize) -> (usize, usize, f32) {
    let t = (pos as f32 + 0.5) / tile_size - 0.5;
    if t <= 0.0 {
        return (0, 0, 1.0);
    }
    let lo = t.floor() as usize;
    if lo + 1 >= tiles {
        return (tiles - 1, tiles - 1, 1.0);
    }
    (lo, lo + 1, 1.0 - (t - lo as f32))
}

/// Enhance float display levels in place
pub fn enhance_levels(
    levels: &mut LevelBuffer,
    alpha: f32,
    n_tiles: u32,
    preserve_blacks: bool,
) -> Result<()> {
    if alpha <= 0.0 {
        return Ok(());
    }
    check_tiles(n_tiles)?;

    let width = levels.width as usize;
    let height = levels.height as usize;
    if width == 0 || height == 0 {
        return Ok(());
    }
    let tiles_x = (n_tiles as usize).min(width);
    let tiles_y = (n_tiles as usize).min(height);
    let tile_w = width as f32 / tiles_x as f32;
    let tile_h = height as f32 / tiles_y as f32;

    log::debug!(
        "Local contrast: {}x{} tiles, alpha {:.2}, preserve_blacks={}",
        tiles_x,
        tiles_y,
        alpha,
        preserve_blacks
    );

    let source = &*levels;
    let luts: Vec<Lut> = (0..tiles_x * tiles_y)
        .into_par_iter()
        .map(|i| {
            let (tx, ty) = (i % tiles_x, i / tiles_x);
            let x0 = (tx as f32 * tile_w).round() as usize;
            let x1 = (((tx + 1) as f32 * tile_w).round() as usize).min(width);
            let y0 = (ty as f32 * tile_h).round() as usize;
            let y1 = (((ty + 1) as f32 * tile_h).round() as usize).min(height);
            tile_lut(source, x0, y0, x1, y1)
        })
        .collect();

    let alpha = alpha.min(1.0);
    levels
        .data
        .par_chunks_mut(width * 3)
        .enumerate()
        .for_each(|(y, row)| {
            let (ty0, ty1, wy) = tile_coord(y, tile_h, tiles_y);
            for x in 0..width {
                let (tx0, tx1, wx) = tile_coord(x, tile_w, tiles_x);
                let px = &mut row[x * 3..x * 3 + 3];
                let original = pixel_level(px);
                if original <= 1e-3 {
                    continue;
                }

                let lut = |tx: usize, ty: usize| lookup(&luts[ty * tiles_x + tx], original);
                let top = lut(tx0, ty0) * wx + lut(tx1, ty0) * (1.0 - wx);
                let bottom = lut(tx0, ty1) * wx + lut(tx1, ty1) * (1.0 - wx);
                let equalized = top * wy + bottom * (1.0 - wy);

                let mut strength = alpha;
                if preserve_blacks && original < BLACK_LEVEL && equalized > original {
                    strength *= original / BLACK_LEVEL;
                }
                let target = original + strength * (equalized - original);
                let scale = target / original;
                for c in px.iter_mut() {
                    *c = (*c * scale).clamp(0.0, 255.0);
                }
            }
        });

    Ok(())
}

/// Enhance an 8-bit frame in place
pub fn enhance_local_contrast(
    frame: &mut FrameBuffer,
    alpha: f32,
    n_tiles: u32,
    preserve_blacks: bool,
) -> Result<()> {
    frame.check()?;
    if alpha <= 0.0 {
        return Ok(());
    }
    let mut levels = LevelBuffer::from_frame(frame)?;
    enhance_levels(&mut levels, alpha, n_tiles, preserve_blacks)?;
    let enhanced = levels.quantize(frame.format, Some(&*frame))?;
    frame.data = enhanced.data;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::synthetic_data::{gradient_frame, uniform_frame};

    #[test]
    fn test_zero_alpha_is_noop() {
        let mut frame = gradient_frame(64, 32, 10, 200);
        let before = frame.clone();
        enhance_local_contrast(&mut frame, 0.0, 4, true).unwrap();
        assert_eq!(frame, before);
    }

    #[test]
    fn test_black_stays_black() {
        let mut frame = uniform_frame(32, 32, 0);
        enhance_local_contrast(&mut frame, 1.0, 4, true).unwrap();
        assert!(frame.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_low_contrast_is_stretched() {
        let mut frame = gradient_frame(128, 32, 100, 140);
        enhance_local_contrast(&mut frame, 1.0, 1, false).unwrap();
        let left = frame.rgb(0, 0)[0];
        let right = frame.rgb(127, 0)[0];
        assert!(right - left > 40, "range {}..{}", left, right);
    }

    #[test]
    fn test_tile_count_is_checked() {
        let mut frame = uniform_frame(8, 8, 100);
        let zero = enhance_local_contrast(&mut frame, 0.5, 0, true).unwrap_err();
        let many = enhance_local_contrast(&mut frame, 0.5, 33, true).unwrap_err();
        assert_eq!(zero, check_tiles(0).unwrap_err());
        let options = crate::hdr::HdrOptions {
            n_tiles: 0,
            ..Default::default()
        };
        assert_eq!(options.validate().unwrap_err(), zero);
        assert!(many.to_string().contains("between 1 and 32"));
        assert!(check_tiles(32).is_ok());
    }

    #[test]
    fn test_lookup_interpolates_between_bins() {
        let mut lut = [0f32; 256];
        lut[10] = 20.0;
        lut[11] = 30.0;
        assert_eq!(lookup(&lut, 10.0), 20.0);
        assert!((lookup(&lut, 10.25) - 22.5).abs() < 1e-4);
        assert_eq!(lookup(&lut, 300.0), lut[255]);
    }

    #[test]
    fn test_float_levels_stay_ordered() {
        // fractional levels inside one bin still map in order
        let mut levels = LevelBuffer::from_frame(&gradient_frame(64, 16, 100, 140)).unwrap();
        let a = (5 * 64 + 20) * 3;
        let b = (5 * 64 + 21) * 3;
        levels.data[a..a + 3].copy_from_slice(&[120.25; 3]);
        levels.data[b..b + 3].copy_from_slice(&[120.75; 3]);
        enhance_levels(&mut levels, 1.0, 1, false).unwrap();
        assert!(levels.data[a] < levels.data[b]);
    }

    #[test]
    fn test_tile_coord_edges() {
        assert_eq!(tile_coord(0, 10.0, 4), (0, 0, 1.0));
        assert_eq!(tile_coord(39, 10.0, 4), (3, 3, 1.0));
        let (lo, hi, w) = tile_coord(10, 10.0, 4);
        assert_eq!((lo, hi), (0, 1));
        assert!((w - 0.45).abs() < 1e-4);
    }
}
