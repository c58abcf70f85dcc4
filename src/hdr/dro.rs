//! Single-frame dynamic range optimisation
//!
//! Lifts under-exposed frames with a gain bounded so the brightest pixel
//! never clips, then a gamma that pulls the median toward mid-grey.

use super::RadianceBuffer;
use crate::errors::Result;
use crate::histogram::{compute_histogram, histogram_stats, HistogramMode};
use crate::types::FrameBuffer;
use serde::{Deserialize, Serialize};

const MAX_GAIN: f32 = 4.0;
const MEDIAN_TARGET: f32 = 0.4;
const MIN_GAMMA: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DroAlgorithm {
    #[default]
    GainGamma,
    None,
}

/// Gain and gamma chosen from a frame's histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainGamma {
    pub gain: f32,
    pub gamma: f32,
}

impl GainGamma {
    pub const IDENTITY: GainGamma = GainGamma {
        gain: 1.0,
        gamma: 1.0,
    };

    pub fn from_frame(frame: &FrameBuffer) -> Self {
        let peak = histogram_stats(&compute_histogram(frame, HistogramMode::Maximum));
        let typical = histogram_stats(&compute_histogram(frame, HistogramMode::Average));
        let (Some(peak), Some(typical)) = (peak, typical) else {
            return Self::IDENTITY;
        };

        let gain = (255.0 / (peak.max_value as f32).max(1.0)).clamp(1.0, MAX_GAIN);
        let median = (typical.median_value as f32 * gain / 255.0).min(1.0);
        let gamma = if median > 0.0 && median < MEDIAN_TARGET {
            (MEDIAN_TARGET.ln() / median.ln()).clamp(MIN_GAMMA, 1.0)
        } else {
            1.0
        };

        log::debug!(
            "DRO gain/gamma: max={} median={} gain={:.3} gamma={:.3}",
            peak.max_value,
            typical.median_value,
            gain,
            gamma
        );

        Self { gain, gamma }
    }

    #[inline]
    pub fn apply(&self, value: f32) -> f32 {
        let v = (value * self.gain).clamp(0.0, 1.0);
        if self.gamma == 1.0 {
            v
        } else {
            v.powf(self.gamma)
        }
    }
}

/// Frame as dithered radiance in `[0, 1]`, with the DRO curve applied
pub fn dro_radiance(frame: &FrameBuffer, algorithm: DroAlgorithm) -> Result<RadianceBuffer> {
    let mut radiance = RadianceBuffer::from_frame(frame)?;
    radiance.dither();
    if algorithm == DroAlgorithm::GainGamma {
        let curve = GainGamma::from_frame(frame);
        if curve != GainGamma::IDENTITY {
            radiance.map_values(|v| curve.apply(v));
        }
    }
    Ok(radiance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdr::{tonemap_levels, TonemapAlgorithm};
    use crate::histogram::percentile;
    use crate::testing::synthetic_data::{gradient_frame, uniform_frame};

    #[test]
    fn test_dark_frame_is_lifted() {
        let frame = gradient_frame(64, 8, 5, 40);
        let curve = GainGamma::from_frame(&frame);
        assert!((curve.gain - 4.0).abs() < 1e-4);
        assert!(curve.gamma < 1.0);
        assert!(curve.apply(40.0 / 255.0) <= 1.0);
    }

    #[test]
    fn test_bright_frame_untouched() {
        let frame = gradient_frame(64, 8, 20, 255);
        assert_eq!(GainGamma::from_frame(&frame), GainGamma::IDENTITY);
    }

    #[test]
    fn test_lifted_levels_have_no_gaps() {
        // gain 4 would leave three empty levels between every input level
        let frame = gradient_frame(256, 32, 5, 40);
        let radiance = dro_radiance(&frame, DroAlgorithm::GainGamma).unwrap();
        let levels = tonemap_levels(&radiance, TonemapAlgorithm::Clamp).unwrap();
        let output = levels.quantize(frame.format, None).unwrap();
        let hist = compute_histogram(&output, HistogramMode::Average);
        let low = percentile(&hist, 0.01).unwrap();
        let high = percentile(&hist, 0.99).unwrap();
        assert!(high - low > 60);
        for level in low..=high {
            assert!(hist[level as usize] > 0, "empty level {}", level);
        }
    }

    #[test]
    fn test_black_frame_stays_black() {
        let frame = uniform_frame(8, 8, 0);
        let radiance = dro_radiance(&frame, DroAlgorithm::GainGamma).unwrap();
        assert!(radiance.data.iter().all(|&v| v == 0.0));
    }
}
