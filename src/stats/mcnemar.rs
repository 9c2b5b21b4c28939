//! McNemar paired significance test over two runs' episode outcomes.
//!
//! Episodes are paired by sample id present in both runs. Small discordant
//! counts use the exact binomial form; larger counts use the chi-square
//! approximation with continuity correction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::StatsError;
use crate::run::state::Run;
use crate::stats::intervals::chi_square_sf_1df;

/// Discordant counts below this use the exact binomial form.
const EXACT_THRESHOLD: u64 = 25;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McNemarResult {
    /// Pairs where run A passed and run B failed.
    pub b01: u64,
    /// Pairs where run A failed and run B passed.
    pub b10: u64,
    /// Paired sample ids shared by both runs.
    pub n_paired: usize,
    pub statistic: f64,
    pub p_value: f64,
    /// True when the exact binomial form was used.
    pub exact: bool,
}

/// Compute binomial coefficient C(n, k) as f64.
fn binomial_coefficient(n: u64, k: u64) -> f64 {
    if k > n {
        return 0.0;
    }
    let k = k.min(n - k);
    let mut result = 1.0;
    for i in 0..k {
        result *= (n - i) as f64 / (i + 1) as f64;
    }
    result
}

/// Two-sided exact binomial p-value for k successes out of n at p = 1/2.
fn exact_binomial_p(k: u64, n: u64) -> f64 {
    let half_pow = 0.5f64.powi(n as i32);
    let tail: f64 = (0..=k).map(|i| binomial_coefficient(n, i) * half_pow).sum();
    (2.0 * tail).min(1.0)
}

/// McNemar's test for paired pass/fail outcomes.
///
/// Fails with `InsufficientPairedSamples` when the runs share no sample
/// ids; callers treat that as "comparison unavailable". Swapping the runs
/// flips the discordant counts but not the p-value.
pub fn mcnemar(run_a: &Run, run_b: &Run) -> Result<McNemarResult, StatsError> {
    let outcomes_a: HashMap<&str, bool> = run_a
        .episodes
        .iter()
        .map(|e| (e.sample_id.as_str(), e.outcome.passed))
        .collect();

    let mut b01 = 0u64;
    let mut b10 = 0u64;
    let mut n_paired = 0usize;
    for ep in &run_b.episodes {
        let passed_a = match outcomes_a.get(ep.sample_id.as_str()) {
            Some(p) => *p,
            None => continue,
        };
        n_paired += 1;
        match (passed_a, ep.outcome.passed) {
            (true, false) => b01 += 1,
            (false, true) => b10 += 1,
            _ => {}
        }
    }

    if n_paired == 0 {
        return Err(StatsError::InsufficientPairedSamples);
    }

    let n = b01 + b10;
    if n == 0 {
        // Fully concordant: no evidence of any difference.
        return Ok(McNemarResult {
            b01,
            b10,
            n_paired,
            statistic: 0.0,
            p_value: 1.0,
            exact: true,
        });
    }

    if n < EXACT_THRESHOLD {
        let k = b01.min(b10);
        Ok(McNemarResult {
            b01,
            b10,
            n_paired,
            statistic: k as f64,
            p_value: exact_binomial_p(k, n),
            exact: true,
        })
    } else {
        // Chi-square with continuity correction.
        let diff = (b01 as f64 - b10 as f64).abs() - 1.0;
        let statistic = (diff.max(0.0)).powi(2) / n as f64;
        Ok(McNemarResult {
            b01,
            b10,
            n_paired,
            statistic,
            p_value: chi_square_sf_1df(statistic),
            exact: false,
        })
    }
}
