//! Brightness histograms and their summary statistics
//!
//! Used as a validation oracle for fused outputs and to drive tonemap and
//! brightening decisions.

use crate::types::FrameBuffer;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// How a pixel is reduced to one 0-255 brightness value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HistogramMode {
    /// `(r + g + b) / 3`
    #[default]
    Average,
    /// `max(r, g, b)`
    Maximum,
    /// Rec.601 luminance
    Luminance,
}

impl HistogramMode {
    #[inline]
    pub fn value(self, rgb: &[u8]) -> u8 {
        let (r, g, b) = (rgb[0] as u32, rgb[1] as u32, rgb[2] as u32);
        match self {
            HistogramMode::Average => ((r + g + b) / 3) as u8,
            HistogramMode::Maximum => r.max(g).max(b) as u8,
            HistogramMode::Luminance => {
                ((299 * r + 587 * g + 114 * b + 500) / 1000).min(255) as u8
            }
        }
    }
}

/// Summary of a 256-bin histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramStats {
    /// First non-empty bin
    pub min_value: u8,
    /// First non-empty bin where the cumulative count reaches `total / 2`
    pub median_value: u8,
    /// Last non-empty bin
    pub max_value: u8,
}

impl HistogramStats {
    /// Whether every statistic is within `tolerance` levels of `expected`
    pub fn within(&self, expected: &HistogramStats, tolerance: u8) -> bool {
        let close = |a: u8, b: u8| a.abs_diff(b) <= tolerance;
        close(self.min_value, expected.min_value)
            && close(self.median_value, expected.median_value)
            && close(self.max_value, expected.max_value)
    }
}

pub fn compute_histogram(frame: &FrameBuffer, mode: HistogramMode) -> [u32; 256] {
    let bpp = frame.format.bytes_per_pixel();
    let row_bytes = (frame.width as usize * bpp).max(bpp);
    let usable = frame.data.len() - frame.data.len() % bpp;

    frame.data[..usable]
        .par_chunks(row_bytes)
        .fold(
            || [0u32; 256],
            |mut hist, row| {
                for px in row.chunks_exact(bpp) {
                    hist[mode.value(px) as usize] += 1;
                }
                hist
            },
        )
        .reduce(
            || [0u32; 256],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                a
            },
        )
}

/// `None` for an empty histogram
///
/// The median is the first non-empty bin whose cumulative count reaches
/// `total / 2` (integer division), so odd totals round the midpoint down.
pub fn histogram_stats(hist: &[u32; 256]) -> Option<HistogramStats> {
    let total: u64 = hist.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return None;
    }

    let min_value = hist.iter().position(|&c| c > 0)? as u8;
    let max_value = hist.iter().rposition(|&c| c > 0)? as u8;

    let middle = total / 2;
    let mut cumulative = 0u64;
    let mut median_value = max_value;
    for (bin, &count) in hist.iter().enumerate() {
        cumulative += count as u64;
        if count > 0 && cumulative >= middle {
            median_value = bin as u8;
            break;
        }
    }

    Some(HistogramStats {
        min_value,
        median_value,
        max_value,
    })
}

/// Histogram with [`HistogramMode::Average`] and its statistics
pub fn analyze(frame: &FrameBuffer) -> Option<HistogramStats> {
    histogram_stats(&compute_histogram(frame, HistogramMode::Average))
}

/// Inclusive ranges of consecutive non-empty bins
pub fn non_zero_runs(hist: &[u32; 256]) -> Vec<(u8, u8)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for (bin, &count) in hist.iter().enumerate() {
        match (count > 0, start) {
            (true, None) => start = Some(bin),
            (false, Some(s)) => {
                runs.push((s as u8, (bin - 1) as u8));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s as u8, 255));
    }
    runs
}

/// Exactly one run of non-empty bins (no posterization gaps)
pub fn is_contiguous(hist: &[u32; 256]) -> bool {
    non_zero_runs(hist).len() == 1
}

/// Smallest bin whose cumulative share reaches `fraction` (0.0-1.0)
pub fn percentile(hist: &[u32; 256], fraction: f32) -> Option<u8> {
    let total: u64 = hist.iter().map(|&c| c as u64).sum();
    if total == 0 {
        return None;
    }
    let target = (fraction.clamp(0.0, 1.0) as f64 * total as f64).ceil().max(1.0) as u64;
    let mut cumulative = 0u64;
    for (bin, &count) in hist.iter().enumerate() {
        cumulative += count as u64;
        if cumulative >= target {
            return Some(bin as u8);
        }
    }
    Some(255)
}
