//! Tonemapping operators
//!
//! Every operator maps linear radiance `x` (1.0 = reference white) to
//! `[0, 1]` given the scene white point `white`. Operators are applied to the
//! brightest channel of a pixel and the other channels are scaled by the
//! same factor, which keeps hue.

use super::{LevelBuffer, RadianceBuffer};
use crate::errors::Result;
use crate::types::{FrameBuffer, PixelFormat};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TonemapAlgorithm {
    /// Extended Reinhard, `x(1 + x/W²)/(1 + x)`
    #[default]
    Reinhard,
    /// `1 - e^(-kx)`, normalized so `W` maps to 1
    Exponential,
    /// Hable "Uncharted 2" filmic curve (FU2)
    Filmic,
    /// Linear clip at 1
    Clamp,
    /// Linear scale by the white point
    None,
}

/// Operator signature: `(radiance, white_point) -> [0, 1]`
pub type ToneCurve = fn(f32, f32) -> f32;

const EXPONENTIAL_K: f32 = 1.5;

const FILMIC_A: f32 = 0.15;
const FILMIC_B: f32 = 0.50;
const FILMIC_C: f32 = 0.10;
const FILMIC_D: f32 = 0.20;
const FILMIC_E: f32 = 0.02;
const FILMIC_F: f32 = 0.30;
const FILMIC_EXPOSURE_BIAS: f32 = 2.0;
const FILMIC_MIN_WHITE: f32 = 11.2;

impl TonemapAlgorithm {
    pub const ALL: [TonemapAlgorithm; 5] = [
        TonemapAlgorithm::Reinhard,
        TonemapAlgorithm::Exponential,
        TonemapAlgorithm::Filmic,
        TonemapAlgorithm::Clamp,
        TonemapAlgorithm::None,
    ];

    pub fn curve(self) -> ToneCurve {
        match self {
            TonemapAlgorithm::Reinhard => reinhard,
            TonemapAlgorithm::Exponential => exponential,
            TonemapAlgorithm::Filmic => filmic,
            TonemapAlgorithm::Clamp => clamp,
            TonemapAlgorithm::None => linear,
        }
    }

    #[inline]
    pub fn apply(self, x: f32, white: f32) -> f32 {
        (self.curve())(x.max(0.0), white.max(1.0)).clamp(0.0, 1.0)
    }

    pub fn name(self) -> &'static str {
        match self {
            TonemapAlgorithm::Reinhard => "reinhard",
            TonemapAlgorithm::Exponential => "exponential",
            TonemapAlgorithm::Filmic => "filmic",
            TonemapAlgorithm::Clamp => "clamp",
            TonemapAlgorithm::None => "none",
        }
    }
}

impl std::str::FromStr for TonemapAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reinhard" => Ok(TonemapAlgorithm::Reinhard),
            "exponential" | "exp" => Ok(TonemapAlgorithm::Exponential),
            "filmic" | "fu2" => Ok(TonemapAlgorithm::Filmic),
            "clamp" => Ok(TonemapAlgorithm::Clamp),
            "none" => Ok(TonemapAlgorithm::None),
            other => Err(format!("unknown tonemap algorithm '{}'", other)),
        }
    }
}

fn reinhard(x: f32, white: f32) -> f32 {
    x * (1.0 + x / (white * white)) / (1.0 + x)
}

fn exponential(x: f32, white: f32) -> f32 {
    (1.0 - (-EXPONENTIAL_K * x).exp()) / (1.0 - (-EXPONENTIAL_K * white).exp())
}

fn hable(v: f32) -> f32 {
    ((v * (FILMIC_A * v + FILMIC_C * FILMIC_B) + FILMIC_D * FILMIC_E)
        / (v * (FILMIC_A * v + FILMIC_B) + FILMIC_D * FILMIC_F))
        - FILMIC_E / FILMIC_F
}

fn filmic(x: f32, white: f32) -> f32 {
    let white_scale = hable((white * FILMIC_EXPOSURE_BIAS).max(FILMIC_MIN_WHITE));
    hable(x * FILMIC_EXPOSURE_BIAS) / white_scale
}

fn clamp(x: f32, _white: f32) -> f32 {
    x.min(1.0)
}

fn linear(x: f32, white: f32) -> f32 {
    x / white
}

/// Map a radiance buffer to display levels without rounding
pub fn tonemap_levels(radiance: &RadianceBuffer, algorithm: TonemapAlgorithm) -> Result<LevelBuffer> {
    let white = radiance.max_value().max(1.0);
    let mut levels = LevelBuffer::new(radiance.width, radiance.height)?;

    log::debug!(
        "Tonemapping {}x{} with {} (white point {:.3})",
        radiance.width,
        radiance.height,
        algorithm.name(),
        white
    );

    levels
        .data
        .par_chunks_mut(3)
        .zip(radiance.data.par_chunks(3))
        .for_each(|(out, px)| {
            let peak = px[0].max(px[1]).max(px[2]);
            if peak <= 0.0 {
                return;
            }
            let scale = algorithm.apply(peak, white) / peak * 255.0;
            for c in 0..3 {
                out[c] = (px[c] * scale).clamp(0.0, 255.0);
            }
        });

    Ok(levels)
}

/// Compress a radiance buffer to 8 bits
///
/// `alpha_source` supplies the alpha channel for RGBA output.
pub fn tonemap_buffer(
    radiance: &RadianceBuffer,
    algorithm: TonemapAlgorithm,
    format: PixelFormat,
    alpha_source: Option<&FrameBuffer>,
) -> Result<FrameBuffer> {
    tonemap_levels(radiance, algorithm)?.quantize(format, alpha_source)
}
