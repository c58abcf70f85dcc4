//! camfusion: multi-frame computational photography
//!
//! Fuses bursts of camera frames into one output image:
//!
//! - HDR merging of exposure brackets, or DRO on a single frame
//! - Temporal averaging for low-light noise reduction
//! - Panorama stitching of a panned sequence
//!
//! Every pipeline aligns frames with a coarse-to-fine pyramid search and
//! excludes moving content with block ghost masks. Frames are moved into a
//! pipeline and a new owned frame comes back.
//!
//! # Usage
//! ```rust,ignore
//! use camfusion::{CaptureMetadata, FusionEngine, HdrOptions};
//!
//! let engine = FusionEngine::with_defaults()?;
//! let output = engine.process(bracket, &CaptureMetadata::default(), &HdrOptions::default())?;
//! println!("median {:?}", output.histogram.map(|h| h.median_value));
//! ```
pub mod align;
pub mod avg;
pub mod config;
pub mod dither;
pub mod errors;
pub mod ghost;
pub mod hdr;
pub mod histogram;
pub mod invariant_ppt;
pub mod panorama;
pub mod types;

// Testing utilities - synthetic scenes for tests and benches
pub mod testing;

// Re-exports for convenience
pub use align::{AlignConfig, Aligner, AlignmentResult, MatchCost};
pub use avg::{Accumulator, AccumulatorSettings, AvgConfig};
pub use config::FusionConfig;
pub use errors::{ErrorKind, ProcessorError, Result};
pub use ghost::{GhostConfig, GhostMask};
pub use hdr::{ContrastEnhancement, DroAlgorithm, FusionEngine, FusionOutput, HdrOptions, TonemapAlgorithm};
pub use histogram::{HistogramMode, HistogramStats};
pub use panorama::{PanoramaOptions, PanoramaOutput, PanoramaStitcher, Projection};
pub use types::{
    AlignmentOffset, CaptureMetadata, FrameBuffer, FusionDiagnostics, OrientationSample,
    PixelFormat, ISO_UNKNOWN,
};

/// Initialize logging for the fusion pipelines
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "camfusion=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        worker_threads: rayon::current_num_threads(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Threads available to the data-parallel stages
    pub worker_threads: usize,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "camfusion");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
        assert!(info.worker_threads >= 1);
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
