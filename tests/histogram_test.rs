//! Histogram and statistics tests
//!
//! Run with: cargo test --test histogram_test

use camfusion::histogram::{
    analyze, compute_histogram, histogram_stats, is_contiguous, non_zero_runs, percentile,
    HistogramMode, HistogramStats,
};
use camfusion::testing::{gradient_frame, uniform_frame};
use camfusion::{FrameBuffer, PixelFormat};

fn single_pixel(rgb: [u8; 3]) -> FrameBuffer {
    FrameBuffer::filled(1, 1, PixelFormat::Rgb8, rgb)
}

// ═══════════════════════════════════════════════════════════════════════════
// MODES
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_modes_reduce_pixels_differently() {
    let frame = single_pixel([30, 60, 240]);

    let average = compute_histogram(&frame, HistogramMode::Average);
    let maximum = compute_histogram(&frame, HistogramMode::Maximum);
    let luminance = compute_histogram(&frame, HistogramMode::Luminance);

    assert_eq!(average[110], 1);
    assert_eq!(maximum[240], 1);
    // 0.299 * 30 + 0.587 * 60 + 0.114 * 240 = 71.55
    assert_eq!(luminance[72], 1);
}

#[test]
fn test_rgba_alpha_is_ignored() {
    let data = vec![90, 90, 90, 0, 90, 90, 90, 255];
    let frame = FrameBuffer::new(data, 2, 1, PixelFormat::Rgba8);
    let hist = compute_histogram(&frame, HistogramMode::Average);
    assert_eq!(hist[90], 2);
    assert_eq!(hist.iter().sum::<u32>(), 2);
}

#[test]
fn test_total_matches_pixel_count() {
    let frame = gradient_frame(123, 45, 10, 200);
    for mode in [
        HistogramMode::Average,
        HistogramMode::Maximum,
        HistogramMode::Luminance,
    ] {
        let hist = compute_histogram(&frame, mode);
        assert_eq!(hist.iter().map(|&c| c as usize).sum::<usize>(), 123 * 45);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_empty_histogram_has_no_stats() {
    assert_eq!(histogram_stats(&[0; 256]), None);
    assert_eq!(percentile(&[0; 256], 0.5), None);
}

#[test]
fn test_uniform_frame_stats() {
    let stats = analyze(&uniform_frame(40, 30, 77)).unwrap();
    assert_eq!(
        stats,
        HistogramStats {
            min_value: 77,
            median_value: 77,
            max_value: 77
        }
    );
}

#[test]
fn test_median_is_first_bin_reaching_half_total() {
    let mut hist = [0u32; 256];
    hist[10] = 2;
    hist[20] = 2;
    hist[30] = 1;
    // 5 / 2 = 2, already reached at bin 10
    let stats = histogram_stats(&hist).unwrap();
    assert_eq!(stats.min_value, 10);
    assert_eq!(stats.median_value, 10);
    assert_eq!(stats.max_value, 30);

    let mut later = [0u32; 256];
    later[10] = 1;
    later[20] = 3;
    later[30] = 3;
    // 7 / 2 = 3, bin 10 holds 1 and bin 20 brings it to 4
    assert_eq!(histogram_stats(&later).unwrap().median_value, 20);

    // an exact half is enough
    let mut even = [0u32; 256];
    even[5] = 3;
    even[250] = 3;
    assert_eq!(histogram_stats(&even).unwrap().median_value, 5);
}

#[test]
fn test_stats_are_ordered_for_gradient() {
    let stats = analyze(&gradient_frame(200, 20, 16, 215)).unwrap();
    assert!(stats.min_value <= stats.median_value);
    assert!(stats.median_value <= stats.max_value);
    assert_eq!(stats.min_value, 16);
    assert_eq!(stats.max_value, 215);
}

#[test]
fn test_stats_tolerance() {
    let expected = HistogramStats {
        min_value: 0,
        median_value: 120,
        max_value: 255,
    };
    let close = HistogramStats {
        min_value: 3,
        median_value: 117,
        max_value: 252,
    };
    let far = HistogramStats {
        median_value: 124,
        ..expected
    };
    assert!(close.within(&expected, 3));
    assert!(!far.within(&expected, 3));
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTIGUITY AND PERCENTILES
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_full_gradient_is_contiguous() {
    let hist = compute_histogram(&gradient_frame(256, 4, 0, 255), HistogramMode::Average);
    assert!(is_contiguous(&hist));
    assert_eq!(non_zero_runs(&hist), vec![(0, 255)]);
}

#[test]
fn test_gaps_are_reported_as_runs() {
    let mut hist = [0u32; 256];
    hist[0] = 1;
    hist[1] = 1;
    hist[3] = 4;
    hist[255] = 1;
    assert!(!is_contiguous(&hist));
    assert_eq!(non_zero_runs(&hist), vec![(0, 1), (3, 3), (255, 255)]);
    assert!(!is_contiguous(&[0; 256]));
}

#[test]
fn test_percentiles() {
    let mut hist = [0u32; 256];
    for bin in 0..100 {
        hist[bin] = 1;
    }
    assert_eq!(percentile(&hist, 0.0), Some(0));
    assert_eq!(percentile(&hist, 0.5), Some(49));
    assert_eq!(percentile(&hist, 0.25), Some(24));
    assert_eq!(percentile(&hist, 1.0), Some(99));
    // out-of-range fractions are clamped
    assert_eq!(percentile(&hist, 7.0), Some(99));
}
