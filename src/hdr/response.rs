//! Exposure response fitting
//!
//! Maps brightness values of one exposure into the units of the base
//! exposure with a linear fit over pixels that are well exposed in both.

use crate::align::pyramid::LumaPlane;
use crate::types::AlignmentOffset;

/// Darkest and brightest luma used when fitting
const FIT_LOW: f32 = 16.0;
const FIT_HIGH: f32 = 239.0;

/// Fewer pairs than this fall back to the mean-ratio estimate
const MIN_FIT_SAMPLES: usize = 64;

const MAX_FIT_SAMPLES: usize = 20_000;

/// `v_base ≈ gain · v + bias`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureResponse {
    pub gain: f32,
    pub bias: f32,
}

impl ExposureResponse {
    pub const IDENTITY: ExposureResponse = ExposureResponse {
        gain: 1.0,
        bias: 0.0,
    };

    #[inline]
    pub fn map(&self, value: f32) -> f32 {
        self.gain * value + self.bias
    }

    /// Fit the response of `other` relative to `base`
    ///
    /// `offset` aligns `other` to `base`.
    pub fn fit(base: &LumaPlane, other: &LumaPlane, offset: AlignmentOffset) -> Self {
        let area = base.width * base.height;
        let step = ((area as f64 / MAX_FIT_SAMPLES as f64).sqrt().ceil() as usize).max(1);

        let mut n = 0usize;
        let (mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for y in (0..base.height).step_by(step) {
            for x in (0..base.width).step_by(step) {
                let Some(v) = other.sample_shifted(x, y, offset.dx, offset.dy) else {
                    continue;
                };
                let b = base.get(x, y);
                if !(FIT_LOW..=FIT_HIGH).contains(&v) || !(FIT_LOW..=FIT_HIGH).contains(&b) {
                    continue;
                }
                let (v, b) = (v as f64, b as f64);
                n += 1;
                sx += v;
                sy += b;
                sxx += v * v;
                sxy += v * b;
            }
        }

        if n >= MIN_FIT_SAMPLES {
            let nf = n as f64;
            let denom = nf * sxx - sx * sx;
            if denom.abs() > 1e-6 {
                let gain = (nf * sxy - sx * sy) / denom;
                let bias = (sy - gain * sx) / nf;
                if gain.is_finite() && gain > 0.0 && bias.is_finite() {
                    log::debug!("Exposure response fit: gain={:.4} bias={:.2} ({} samples)", gain, bias, n);
                    return Self {
                        gain: gain as f32,
                        bias: bias as f32,
                    };
                }
            }
        }

        Self::from_means(base, other)
    }

    /// Ratio of mean brightness, used when too few pixels are well exposed
    pub fn from_means(base: &LumaPlane, other: &LumaPlane) -> Self {
        let (base_mean, _) = base.mean_and_std();
        let (other_mean, _) = other.mean_and_std();
        if other_mean > 1e-3 && base_mean > 1e-3 {
            Self {
                gain: base_mean / other_mean,
                bias: 0.0,
            }
        } else {
            Self::IDENTITY
        }
    }

    /// Candidate plane expressed in base units, clamped to the 8-bit range
    pub fn map_plane(&self, plane: &LumaPlane) -> LumaPlane {
        let data = plane
            .data
            .iter()
            .map(|&v| self.map(v).clamp(0.0, 255.0))
            .collect();
        LumaPlane::new(plane.width, plane.height, data)
    }
}
