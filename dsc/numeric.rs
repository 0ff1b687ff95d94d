// ========================================================================================
//                             Small numeric building blocks
// ========================================================================================
//
// Pure scalar and slice helpers composed by the decomposition engine. None of them
// allocate except `retain_observed`, which reuses the caller's buffer.

use ndarray::ArrayView1;

/// DSC values at or below this magnitude are reported as exactly zero.
pub const NEGLIGIBLE_DSC: f64 = 1e-7;

/// Magnitude at which reported values saturate to an infinity.
pub const SATURATION_LIMIT: f64 = 1e6;

/// `true` for a non-NaN value small enough to be reported as zero.
#[inline]
pub fn is_negligible(value: f64) -> bool {
    !value.is_nan() && value <= NEGLIGIBLE_DSC
}

/// Applies the epsilon floor. NaN passes through untouched.
#[inline]
pub fn floor_negligible(value: f64) -> f64 {
    if is_negligible(value) { 0.0 } else { value }
}

/// Ratio of between- to within-batch dispersion. Undefined (NaN) unless the
/// denominator is a positive number.
#[inline]
pub fn dispersion_ratio(between: f64, within: f64) -> f64 {
    if !within.is_nan() && within > 0.0 {
        between / within
    } else {
        f64::NAN
    }
}

/// Copies every non-NaN entry of `values` into `observed`, replacing its contents.
#[inline]
pub fn retain_observed(values: &[f64], observed: &mut Vec<f64>) {
    observed.clear();
    observed.extend(values.iter().copied().filter(|v| !v.is_nan()));
}

/// Arithmetic mean. The mean of an empty sample is NaN.
#[inline]
pub fn mean(values: &[f64]) -> f64 {
    ArrayView1::from(values).mean().unwrap_or(f64::NAN)
}

/// Sample variance with an (n - 1) denominator. Fewer than two values leave the
/// denominator at zero or below, which yields NaN.
#[inline]
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    ArrayView1::from(values).var(1.0)
}

/// Reporting transform for written results: huge magnitudes become infinities and
/// tiny positive values become zero. Never applied to in-memory statistics.
pub fn saturate_extreme(value: f64) -> f64 {
    if value.is_nan() || value.is_infinite() {
        value
    } else if value >= SATURATION_LIMIT {
        f64::INFINITY
    } else if value <= -SATURATION_LIMIT {
        f64::NEG_INFINITY
    } else if value > 0.0 && value <= NEGLIGIBLE_DSC {
        0.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn floor_zeroes_values_at_or_below_threshold() {
        assert_eq!(floor_negligible(1e-7), 0.0);
        assert_eq!(floor_negligible(5e-8), 0.0);
        assert_eq!(floor_negligible(0.0), 0.0);
        assert_eq!(floor_negligible(2e-7), 2e-7);
        assert!(floor_negligible(f64::NAN).is_nan());
    }

    #[test]
    fn ratio_requires_positive_denominator() {
        assert_eq!(dispersion_ratio(1.0, 0.5), 2.0);
        assert!(dispersion_ratio(1.0, 0.0).is_nan());
        assert!(dispersion_ratio(1.0, f64::NAN).is_nan());
        assert!(dispersion_ratio(1.0, -1.0).is_nan());
    }

    #[test]
    fn retain_observed_drops_nan_and_reuses_buffer() {
        let mut observed = vec![99.0, 98.0, 97.0, 96.0];
        retain_observed(&[1.0, f64::NAN, 3.0], &mut observed);
        assert_eq!(observed, vec![1.0, 3.0]);

        retain_observed(&[f64::NAN], &mut observed);
        assert!(observed.is_empty());
    }

    #[test]
    fn mean_and_variance_follow_sample_conventions() {
        assert_abs_diff_eq!(mean(&[1.0, 2.0]), 1.5);
        assert_abs_diff_eq!(sample_variance(&[1.0, 2.0]), 0.5);
        assert_abs_diff_eq!(sample_variance(&[10.0, 20.0]), 50.0);
        assert!(mean(&[]).is_nan());
        assert!(sample_variance(&[]).is_nan());
        assert!(sample_variance(&[4.0]).is_nan());
    }

    #[test]
    fn saturation_maps_extremes() {
        assert_eq!(saturate_extreme(2e6), f64::INFINITY);
        assert_eq!(saturate_extreme(-1e6), f64::NEG_INFINITY);
        assert_eq!(saturate_extreme(5e-8), 0.0);
        assert_eq!(saturate_extreme(-5e-8), -5e-8);
        assert_eq!(saturate_extreme(3.25), 3.25);
        assert!(saturate_extreme(f64::NAN).is_nan());
    }
}
