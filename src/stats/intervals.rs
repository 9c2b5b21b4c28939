//! Binomial confidence intervals and the normal-distribution helpers they
//! share with the paired test.
//!
//! Plain-f64 rational approximations; no external math crate.

use crate::errors::StatsError;

/// Inverse standard normal CDF (Acklam's rational approximation, relative
/// error below 1.15e-9 over the open unit interval).
pub fn z_quantile(p: f64) -> f64 {
    debug_assert!(p > 0.0 && p < 1.0);

    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Error function (Abramowitz & Stegun 7.1.26, |error| <= 1.5e-7).
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Survival function of a chi-square distribution with one degree of freedom.
pub fn chi_square_sf_1df(x: f64) -> f64 {
    if x <= 0.0 {
        return 1.0;
    }
    2.0 * (1.0 - normal_cdf(x.sqrt()))
}

/// Wilson score interval for a binomial proportion.
///
/// Finite and valid at the boundaries `successes = 0` and `successes = n`,
/// unlike the normal approximation. Fails with `InvalidInput` when `n = 0`,
/// when `successes > n`, or when the confidence level is not in (0, 1).
pub fn wilson_interval(
    successes: u64,
    n: u64,
    confidence: f64,
) -> Result<(f64, f64), StatsError> {
    if n == 0 {
        return Err(StatsError::InvalidInput("n must be positive".into()));
    }
    if successes > n {
        return Err(StatsError::InvalidInput(format!(
            "successes ({}) exceeds n ({})",
            successes, n
        )));
    }
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(StatsError::InvalidInput(format!(
            "confidence must be in (0, 1), got {}",
            confidence
        )));
    }

    let z = z_quantile(1.0 - (1.0 - confidence) / 2.0);
    let n_f = n as f64;
    let p_hat = successes as f64 / n_f;

    let z2 = z * z;
    let center = p_hat + z2 / (2.0 * n_f);
    let margin = z * (p_hat * (1.0 - p_hat) / n_f + z2 / (4.0 * n_f * n_f)).sqrt();
    let denom = 1.0 + z2 / n_f;

    let lower = ((center - margin) / denom).max(0.0);
    let upper = ((center + margin) / denom).min(1.0);
    Ok((lower, upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_z_quantile_known_values() {
        assert!((z_quantile(0.975) - 1.959964).abs() < 1e-5);
        assert!((z_quantile(0.995) - 2.575829).abs() < 1e-5);
        assert!((z_quantile(0.5)).abs() < 1e-9);
        // Symmetric about 0.5.
        assert!((z_quantile(0.025) + z_quantile(0.975)).abs() < 1e-9);
    }

    #[test]
    fn test_normal_cdf_known_values() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.959964) - 0.975).abs() < 1e-6);
        assert!((normal_cdf(-1.0) - 0.158655).abs() < 1e-6);
    }

    #[test]
    fn test_wilson_rejects_bad_input() {
        assert!(wilson_interval(0, 0, 0.95).is_err());
        assert!(wilson_interval(5, 3, 0.95).is_err());
        assert!(wilson_interval(1, 10, 0.0).is_err());
        assert!(wilson_interval(1, 10, 1.0).is_err());
    }

    #[test]
    fn test_wilson_contains_point_estimate() {
        for (s, n) in [(0u64, 10u64), (3, 10), (5, 10), (10, 10), (1, 1)] {
            let (lower, upper) = wilson_interval(s, n, 0.95).unwrap();
            let p_hat = s as f64 / n as f64;
            assert!(0.0 <= lower, "lower bound below 0 for {}/{}", s, n);
            assert!(lower <= p_hat && p_hat <= upper, "estimate outside interval for {}/{}", s, n);
            assert!(upper <= 1.0, "upper bound above 1 for {}/{}", s, n);
        }
    }

    #[test]
    fn test_wilson_boundaries_are_exact() {
        let (lower, _) = wilson_interval(0, 20, 0.95).unwrap();
        assert_eq!(lower, 0.0);
        let (_, upper) = wilson_interval(20, 20, 0.95).unwrap();
        assert_eq!(upper, 1.0);
    }

    #[test]
    fn test_wilson_known_value() {
        // 8/10 at 95%: Wilson gives roughly (0.490, 0.943).
        let (lower, upper) = wilson_interval(8, 10, 0.95).unwrap();
        assert!((lower - 0.490).abs() < 5e-3, "lower = {}", lower);
        assert!((upper - 0.943).abs() < 5e-3, "upper = {}", upper);
    }

    #[test]
    fn test_wilson_narrows_with_more_data() {
        let (l1, u1) = wilson_interval(8, 10, 0.95).unwrap();
        let (l2, u2) = wilson_interval(80, 100, 0.95).unwrap();
        assert!(u2 - l2 < u1 - l1);
    }

    #[test]
    fn test_chi_square_sf() {
        assert_eq!(chi_square_sf_1df(0.0), 1.0);
        // 3.841 is the 95th percentile of chi-square with 1 df.
        assert!((chi_square_sf_1df(3.841) - 0.05).abs() < 1e-3);
    }
}
