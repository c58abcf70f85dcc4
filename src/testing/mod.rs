//! Testing utilities
//!
//! Deterministic synthetic scenes for unit tests, integration tests and
//! benches.

pub mod synthetic_data;

pub use synthetic_data::{
    exposure_bracket, gradient_frame, noisy_copy, panorama_sequence, scene_value,
    shifted_frame, textured_frame, textured_frame_at, uniform_frame, with_square,
};
