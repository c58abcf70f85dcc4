//! Deterministic dither for 8-bit requantisation
//!
//! A curve or gain steeper than one maps neighbouring input levels to output
//! levels more than one apart, leaving empty histogram bins. Spreading each
//! input level over `(-1, 1)` levels of triangular noise before the curve
//! turns every level into a short ramp that fills the space in between.
//!
//! The noise is a hash of the pixel position, so repeated runs produce
//! identical output.

const SEED_A: u64 = 0x2545_F491_4F6C_DD1D;
const SEED_B: u64 = 0x6A09_E667_F3BC_C909;

/// Position hash in `[0, 1)` with 24 bits of resolution
pub fn unit_hash(seed: u64, x: i64, y: i64) -> f32 {
    let mut z = seed
        .wrapping_add((x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
        .wrapping_add((y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 40) as f32 / (1u64 << 24) as f32
}

/// Triangular dither in `[-1, 1)` input levels for pixel `(x, y)`
#[inline]
pub fn triangular(x: usize, y: usize) -> f32 {
    unit_hash(SEED_A, x as i64, y as i64) + unit_hash(SEED_B, x as i64, y as i64) - 1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangular_is_bounded_and_centred() {
        let mut sum = 0.0f64;
        let n = 256 * 256;
        for y in 0..256 {
            for x in 0..256 {
                let d = triangular(x, y);
                assert!((-1.0..1.0).contains(&d));
                sum += d as f64;
            }
        }
        assert!((sum / n as f64).abs() < 0.01);
    }

    #[test]
    fn test_triangular_is_deterministic() {
        assert_eq!(triangular(17, 3), triangular(17, 3));
        assert_ne!(triangular(17, 3), triangular(3, 17));
    }

    #[test]
    fn test_triangular_peaks_at_zero() {
        let mut near = 0;
        let mut far = 0;
        for y in 0..128 {
            for x in 0..128 {
                let d = triangular(x, y).abs();
                if d < 0.25 {
                    near += 1;
                } else if d > 0.75 {
                    far += 1;
                }
            }
        }
        // 7/16 of samples within 0.25 of zero, 1/16 beyond 0.75
        assert!(near > 4 * far, "near {} far {}", near, far);
    }
}
