//! Statistical comparison engine: confidence intervals, paired testing,
//! failure taxonomy, and run-level aggregation.

pub mod intervals;
pub mod mcnemar;
pub mod taxonomy;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::StatsError;
use crate::run::episode::TraceKind;
use crate::run::state::Run;

pub use intervals::wilson_interval;
pub use mcnemar::{mcnemar, McNemarResult};
pub use taxonomy::classify_failure;

/// Aggregate view of one run: pass counts, score, confidence interval, and
/// the per-failure-mode breakdown. Distinguishes "model could not answer"
/// (the chain was tried and exhausted) from "harness could not execute"
/// (the sample never produced a model attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub benchmark: String,
    pub solver: String,
    pub n_total: usize,
    pub n_passed: usize,
    pub pass_rate: f64,
    pub mean_score: f64,
    pub confidence: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Failure mode name -> count.
    pub failures: BTreeMap<String, usize>,
    pub n_model_unanswered: usize,
    pub n_harness_errors: usize,
}

/// Build the aggregate report for a run.
///
/// An empty run reports the vacuous interval `[0, 1]` rather than failing,
/// so a cancelled run still renders.
pub fn run_report(run: &Run, confidence: f64) -> Result<RunReport, StatsError> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(StatsError::InvalidInput(format!(
            "confidence must be in (0, 1), got {}",
            confidence
        )));
    }

    let n_total = run.episodes.len();
    let n_passed = run.episodes.iter().filter(|e| e.outcome.passed).count();
    let (ci_lower, ci_upper) = if n_total == 0 {
        (0.0, 1.0)
    } else {
        wilson_interval(n_passed as u64, n_total as u64, confidence)?
    };

    let mut failures: BTreeMap<String, usize> = BTreeMap::new();
    let mut n_model_unanswered = 0usize;
    let mut n_harness_errors = 0usize;
    for ep in run.episodes.iter().filter(|e| !e.outcome.passed) {
        if let Some(mode) = ep.outcome.failure_mode {
            *failures.entry(mode.to_string()).or_insert(0) += 1;
        }
        if ep.action.answer.trim().is_empty() {
            if ep.has_trace(TraceKind::ModelError) {
                n_model_unanswered += 1;
            } else {
                n_harness_errors += 1;
            }
        }
    }

    let mean_score = if n_total == 0 {
        0.0
    } else {
        run.episodes.iter().map(|e| e.outcome.score).sum::<f64>() / n_total as f64
    };

    Ok(RunReport {
        run_id: run.id.clone(),
        benchmark: run.benchmark.clone(),
        solver: run.solver.clone(),
        n_total,
        n_passed,
        pass_rate: if n_total == 0 {
            0.0
        } else {
            n_passed as f64 / n_total as f64
        },
        mean_score,
        confidence,
        ci_lower,
        ci_upper,
        failures,
        n_model_unanswered,
        n_harness_errors,
    })
}

/// Paired comparison of two runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub run_a: String,
    pub run_b: String,
    pub pass_rate_a: f64,
    pub pass_rate_b: f64,
    pub interval_a: (f64, f64),
    pub interval_b: (f64, f64),
    pub mcnemar: McNemarResult,
}

/// Compare two runs: per-run Wilson intervals plus the McNemar paired test.
/// Surfaces `StatsError` when either run is empty or the runs share no
/// sample ids; callers present that as "comparison unavailable".
pub fn compare(run_a: &Run, run_b: &Run, confidence: f64) -> Result<Comparison, StatsError> {
    let n_a = run_a.episodes.len() as u64;
    let n_b = run_b.episodes.len() as u64;
    let passed_a = run_a.episodes.iter().filter(|e| e.outcome.passed).count() as u64;
    let passed_b = run_b.episodes.iter().filter(|e| e.outcome.passed).count() as u64;

    let interval_a = wilson_interval(passed_a, n_a, confidence)?;
    let interval_b = wilson_interval(passed_b, n_b, confidence)?;
    let mcnemar = mcnemar::mcnemar(run_a, run_b)?;

    Ok(Comparison {
        run_a: run_a.id.clone(),
        run_b: run_b.id.clone(),
        pass_rate_a: passed_a as f64 / n_a as f64,
        pass_rate_b: passed_b as f64 / n_b as f64,
        interval_a,
        interval_b,
        mcnemar,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::episode::{Action, Episode, FailureMode, Outcome, TraceEvent};
    use std::collections::HashMap;

    fn run_with_modes(modes: &[Option<FailureMode>]) -> Run {
        let mut run = Run::new("bench", "baseline", vec![]);
        for (i, mode) in modes.iter().enumerate() {
            let passed = mode.is_none();
            let traces = match mode {
                Some(FailureMode::Crash) => {
                    vec![TraceEvent::new(TraceKind::ModelError, "all failed")]
                }
                Some(FailureMode::Timeout) => {
                    vec![TraceEvent::new(TraceKind::Timeout, "deadline")]
                }
                _ => vec![],
            };
            let answer = match mode {
                Some(FailureMode::WrongAnswer) => "wrong",
                Some(_) => "",
                None => "right",
            };
            run.episodes.push(Episode::new(
                &run.id,
                &format!("s{}", i),
                i,
                HashMap::new(),
                traces,
                Action {
                    answer: answer.into(),
                    tool_calls: 0,
                },
                Outcome {
                    passed,
                    score: if passed { 1.0 } else { 0.0 },
                    failure_mode: *mode,
                },
            ));
        }
        run
    }

    #[test]
    fn test_report_counts_and_breakdown() {
        let run = run_with_modes(&[
            None,
            None,
            Some(FailureMode::WrongAnswer),
            Some(FailureMode::WrongAnswer),
            Some(FailureMode::Crash),
        ]);
        let report = run_report(&run, 0.95).unwrap();
        assert_eq!(report.n_total, 5);
        assert_eq!(report.n_passed, 2);
        assert_eq!(report.failures["wrong_answer"], 2);
        assert_eq!(report.failures["crash"], 1);
        assert_eq!(report.n_model_unanswered, 1);
        assert_eq!(report.n_harness_errors, 0);
        assert!(report.ci_lower <= report.pass_rate && report.pass_rate <= report.ci_upper);
    }

    #[test]
    fn test_report_distinguishes_harness_errors() {
        // A timeout with no model error trace never reached a model.
        let run = run_with_modes(&[Some(FailureMode::Timeout)]);
        let report = run_report(&run, 0.95).unwrap();
        assert_eq!(report.n_harness_errors, 1);
        assert_eq!(report.n_model_unanswered, 0);
    }

    #[test]
    fn test_empty_run_reports_vacuous_interval() {
        let run = run_with_modes(&[]);
        let report = run_report(&run, 0.95).unwrap();
        assert_eq!((report.ci_lower, report.ci_upper), (0.0, 1.0));
        assert_eq!(report.pass_rate, 0.0);
    }

    #[test]
    fn test_report_rejects_bad_confidence() {
        let run = run_with_modes(&[None]);
        assert!(run_report(&run, 1.5).is_err());
    }

    #[test]
    fn test_compare_unavailable_on_empty_run() {
        let a = run_with_modes(&[]);
        let b = run_with_modes(&[None]);
        assert!(compare(&a, &b, 0.95).is_err());
    }

    #[test]
    fn test_compare_pairs_by_sample_id() {
        let a = run_with_modes(&[None, Some(FailureMode::WrongAnswer)]);
        let b = run_with_modes(&[None, None]);
        let cmp = compare(&a, &b, 0.95).unwrap();
        assert_eq!(cmp.mcnemar.n_paired, 2);
        assert_eq!(cmp.mcnemar.b10, 1);
        assert_eq!(cmp.pass_rate_a, 0.5);
        assert_eq!(cmp.pass_rate_b, 1.0);
    }
}
