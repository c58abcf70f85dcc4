//! Contract tests: each pipeline must check its runtime invariants
//!
//! Run with: cargo test --test contract_test

use camfusion::invariant_ppt::{clear_invariant_log, contract_test, invariant_hits};
use camfusion::panorama::stitch;
use camfusion::testing::{exposure_bracket, panorama_sequence, shifted_frame, textured_frame};
use camfusion::{
    Accumulator, AccumulatorSettings, AlignConfig, Aligner, CaptureMetadata, FusionEngine,
    HdrOptions, PanoramaOptions, Projection,
};

#[test]
fn contract_alignment_rescales_offsets() {
    clear_invariant_log();
    let aligner = Aligner::new(AlignConfig {
        working_max_dimension: 64,
        ..Default::default()
    })
    .unwrap();
    let base = textured_frame(256, 128, 1);
    aligner.align(&base, &shifted_frame(&base, 4, 0)).unwrap();

    contract_test(
        "alignment",
        &["Working-resolution offsets are rescaled to input pixels"],
    );
}

#[test]
fn contract_hdr_keeps_dimensions() {
    clear_invariant_log();
    let engine = FusionEngine::with_defaults().unwrap();
    let frames = exposure_bracket(&textured_frame(96, 64, 2), &[0.5, 1.0, 2.0]);
    engine
        .process(frames, &CaptureMetadata::default(), &HdrOptions::default())
        .unwrap();
    engine
        .process_dro(textured_frame(33, 17, 3), &HdrOptions::default())
        .unwrap();

    contract_test("hdr", &["Fused output keeps input dimensions"]);
    assert_eq!(invariant_hits("Fused output keeps input dimensions"), 2);
}

#[test]
fn contract_averaging_resolution() {
    clear_invariant_log();
    let metadata = CaptureMetadata::new(1600, 100_000_000, 1.0);
    let base = textured_frame(128, 96, 4);
    let mut acc = Accumulator::init(
        base.clone(),
        base.clone(),
        1.0,
        &metadata,
        AccumulatorSettings::default(),
    )
    .unwrap();
    acc.update(base, 2.0, &metadata).unwrap();
    acc.brighten(&metadata).unwrap();

    contract_test(
        "averaging",
        &[
            "Averaged frames share one working resolution",
            "Averaged output is at the working resolution",
        ],
    );
}

#[test]
fn contract_panorama_crop() {
    clear_invariant_log();
    let options = PanoramaOptions {
        projection: Projection::Cylindrical,
        pics_per_screen: 160.0 / 48.0,
        ..Default::default()
    };
    assert!(options.crop);
    stitch(
        panorama_sequence(160, 120, 3, 48, 5),
        None,
        &options,
        &AlignConfig::default(),
    )
    .unwrap();

    contract_test(
        "panorama",
        &["Panorama edges stay within the unpainted tolerance"],
    );
}
