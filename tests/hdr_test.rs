//! HDR and DRO fusion tests
//!
//! Run with: cargo test --test hdr_test

use camfusion::errors::{ErrorKind, ProcessorError};
use camfusion::hdr::{FusionEngine, HdrOptions, TonemapAlgorithm};
use camfusion::histogram::{analyze, compute_histogram, is_contiguous, percentile, HistogramMode};
use camfusion::testing::{
    exposure_bracket, gradient_frame, noisy_copy, shifted_frame, textured_frame,
};
use camfusion::{AlignmentOffset, CaptureMetadata, FrameBuffer, PixelFormat};

fn engine() -> FusionEngine {
    FusionEngine::with_defaults().unwrap()
}

/// Assert every level between the 1st and 99th percentile is populated
/// and return that span
fn assert_body_has_no_gaps(frame: &FrameBuffer, label: &str) -> (u8, u8) {
    let hist = compute_histogram(frame, HistogramMode::Average);
    let low = percentile(&hist, 0.01).unwrap();
    let high = percentile(&hist, 0.99).unwrap();
    for level in low..=high {
        assert!(
            hist[level as usize] > 0,
            "{}: empty level {} inside {}..{}",
            label,
            level,
            low,
            high
        );
    }
    (low, high)
}

// ═══════════════════════════════════════════════════════════════════════════
// IDENTITY LAW
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_zero_mode_is_identity_row_by_row() {
    let input = textured_frame(301, 177, 42);
    let expected = input.clone();

    let output = engine()
        .process(vec![input], &CaptureMetadata::default(), &HdrOptions::identity())
        .unwrap();

    assert_eq!(output.frame.dimensions(), expected.dimensions());
    let stride = expected.width as usize * 3;
    for (y, (got, want)) in output
        .frame
        .data
        .chunks_exact(stride)
        .zip(expected.data.chunks_exact(stride))
        .enumerate()
    {
        assert_eq!(got, want, "row {} differs", y);
    }
}

#[test]
fn test_zero_mode_keeps_rgba() {
    let rgba: Vec<u8> = (0..40 * 30)
        .flat_map(|i| [(i % 251) as u8, (i % 83) as u8, (i % 17) as u8, (i % 7) as u8])
        .collect();
    let input = FrameBuffer::new(rgba, 40, 30, PixelFormat::Rgba8);
    let output = engine().process_dro(input.clone(), &HdrOptions::identity()).unwrap();
    assert_eq!(output.frame, input);
}

// ═══════════════════════════════════════════════════════════════════════════
// BRACKET FUSION
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bracket_output_keeps_dimensions() {
    let base = textured_frame(160, 120, 1);
    let frames = exposure_bracket(&base, &[0.5, 1.0, 1.8]);

    for algorithm in TonemapAlgorithm::ALL {
        let options = HdrOptions {
            tonemap: algorithm,
            ..Default::default()
        };
        let output = engine()
            .process(frames.clone(), &CaptureMetadata::default(), &options)
            .unwrap();
        assert_eq!(output.frame.dimensions(), (160, 120), "{:?}", algorithm);
        assert_eq!(output.frame.format, PixelFormat::Rgb8);
        assert_eq!(output.diagnostics.offsets.len(), 3);
        assert_eq!(output.diagnostics.sharp_index, 1);
        assert_eq!(output.histogram, analyze(&output.frame));
    }
}

#[test]
fn test_bracket_offsets_are_reported() {
    let base = textured_frame(200, 150, 8);
    let mut frames = exposure_bracket(&base, &[0.6, 1.0, 1.5]);
    frames[0] = shifted_frame(&frames[0], 2, 0);

    let output = engine()
        .process(frames, &CaptureMetadata::default(), &HdrOptions::default())
        .unwrap();

    let offsets = &output.diagnostics.offsets;
    assert!((offsets[0].dx - 2).abs() <= 1 && offsets[0].dy.abs() <= 1);
    assert_eq!(offsets[1], AlignmentOffset::ZERO);
    assert!(offsets[2].dx.abs() <= 1 && offsets[2].dy.abs() <= 1);
}

#[test]
fn test_unsorted_bracket_picks_middle_exposure() {
    let base = textured_frame(96, 72, 5);
    let bracket = exposure_bracket(&base, &[0.5, 1.0, 1.6]);
    // bright, dark, middle
    let frames = vec![bracket[2].clone(), bracket[0].clone(), bracket[1].clone()];

    let options = HdrOptions {
        assume_sorted: false,
        ..Default::default()
    };
    let output = engine()
        .process(frames, &CaptureMetadata::default(), &options)
        .unwrap();
    assert_eq!(output.diagnostics.sharp_index, 2);
}

#[test]
fn test_fusion_extends_dark_frame() {
    let base = textured_frame(128, 96, 3);
    let frames = exposure_bracket(&base, &[0.4, 1.0, 2.0]);
    let dark_max = analyze(&frames[0]).unwrap().max_value;

    let output = engine()
        .process(frames, &CaptureMetadata::default(), &HdrOptions::default())
        .unwrap();
    let stats = output.histogram.unwrap();
    assert!(stats.min_value <= stats.median_value);
    assert!(stats.median_value <= stats.max_value);
    assert!(stats.max_value > dark_max);
}

#[test]
fn test_identical_bracket_with_clamp_is_contiguous() {
    let frame = gradient_frame(256, 16, 0, 255);
    let options = HdrOptions {
        alpha: 0.0,
        tonemap: TonemapAlgorithm::Clamp,
        ..Default::default()
    };
    let output = engine()
        .process(vec![frame.clone(); 3], &CaptureMetadata::default(), &options)
        .unwrap();

    let hist = compute_histogram(&output.frame, HistogramMode::Average);
    assert!(is_contiguous(&hist));
    // dither moves a level by at most one
    for (got, want) in output.frame.data.iter().zip(frame.data.iter()) {
        assert!(got.abs_diff(*want) <= 1, "{} vs {}", got, want);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HISTOGRAM CONTIGUITY
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_bracket_has_no_gaps_for_every_tonemap() {
    let base = noisy_copy(&gradient_frame(256, 64, 40, 200), 11, 3.0);
    let frames = exposure_bracket(&base, &[0.5, 1.0, 2.0]);

    for algorithm in TonemapAlgorithm::ALL {
        let options = HdrOptions {
            tonemap: algorithm,
            ..Default::default()
        };
        let output = engine()
            .process(frames.clone(), &CaptureMetadata::default(), &options)
            .unwrap();
        let (low, high) = assert_body_has_no_gaps(&output.frame, algorithm.name());
        assert!(high - low > 40, "{:?}: {}..{}", algorithm, low, high);
    }
}

#[test]
fn test_dro_has_no_gaps_for_every_tonemap() {
    let dark = noisy_copy(&gradient_frame(256, 64, 8, 90), 5, 2.0);

    for algorithm in TonemapAlgorithm::ALL {
        let options = HdrOptions {
            tonemap: algorithm,
            ..Default::default()
        };
        let output = engine().process_dro(dark.clone(), &options).unwrap();
        let (low, high) = assert_body_has_no_gaps(&output.frame, algorithm.name());
        assert!(high - low > 40, "{:?}: {}..{}", algorithm, low, high);
    }
}

#[test]
fn test_dro_brightens_dark_frame() {
    let dark = gradient_frame(128, 32, 5, 60);
    let before = analyze(&dark).unwrap();
    let output = engine().process_dro(dark, &HdrOptions::default()).unwrap();
    let after = output.histogram.unwrap();
    assert!(after.median_value > before.median_value);
    assert_eq!(output.frame.dimensions(), (128, 32));
}

// ═══════════════════════════════════════════════════════════════════════════
// PRECONDITIONS
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn test_empty_input() {
    let result = engine().process(Vec::new(), &CaptureMetadata::default(), &HdrOptions::default());
    assert!(matches!(result, Err(ProcessorError::EmptyInput)));
}

#[test]
fn test_mismatched_dimensions() {
    let frames = vec![textured_frame(64, 48, 1), textured_frame(48, 64, 1)];
    let err = engine()
        .process(frames, &CaptureMetadata::default(), &HdrOptions::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionViolation);
    assert!(matches!(err, ProcessorError::DimensionMismatch { .. }));
}

#[test]
fn test_mismatched_format() {
    let rgb = textured_frame(16, 16, 1);
    let rgba = FrameBuffer::filled(16, 16, PixelFormat::Rgba8, [1, 2, 3]);
    let err = engine()
        .process(vec![rgb, rgba], &CaptureMetadata::default(), &HdrOptions::default())
        .unwrap_err();
    assert!(matches!(err, ProcessorError::FormatMismatch { .. }));
}

#[test]
fn test_truncated_frame_is_rejected() {
    let broken = FrameBuffer::new(vec![0; 10], 16, 16, PixelFormat::Rgb8);
    let err = engine()
        .process(vec![broken], &CaptureMetadata::default(), &HdrOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ProcessorError::DataCorruption {
            frame_size: 10,
            expected_size: 768
        }
    ));
}

#[test]
fn test_invalid_options() {
    let options = HdrOptions {
        alpha: -0.5,
        ..Default::default()
    };
    let err = engine()
        .process(vec![textured_frame(16, 16, 1)], &CaptureMetadata::default(), &options)
        .unwrap_err();
    assert!(matches!(err, ProcessorError::InvalidConfig(_)));
}
