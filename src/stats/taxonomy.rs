//! Failure taxonomy classification.

use crate::run::episode::{Episode, FailureMode, TraceKind};

/// Classify a failed episode into exactly one failure mode.
///
/// Pure function of the episode, with explicit precedence: a cost ceiling
/// beats everything (even if the episode also timed out); a timeout with no
/// answer produced is a timeout; a completed-but-incorrect answer is a
/// wrong answer; anything else is a crash.
pub fn classify_failure(episode: &Episode) -> FailureMode {
    if episode.has_trace(TraceKind::CostLimit) {
        return FailureMode::CostLimit;
    }
    let has_answer = !episode.action.answer.trim().is_empty();
    if episode.has_trace(TraceKind::Timeout) && !has_answer {
        return FailureMode::Timeout;
    }
    if has_answer {
        return FailureMode::WrongAnswer;
    }
    FailureMode::Crash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::episode::{Action, Episode, Outcome, TraceEvent};
    use std::collections::HashMap;

    fn failed_episode(traces: Vec<TraceEvent>, answer: &str) -> Episode {
        Episode::new(
            "r",
            "s",
            0,
            HashMap::new(),
            traces,
            Action {
                answer: answer.into(),
                tool_calls: 0,
            },
            Outcome {
                passed: false,
                score: 0.0,
                failure_mode: None,
            },
        )
    }

    #[test]
    fn test_cost_limit_beats_timeout() {
        let ep = failed_episode(
            vec![
                TraceEvent::new(TraceKind::Timeout, "deadline"),
                TraceEvent::new(TraceKind::CostLimit, "budget ceiling"),
            ],
            "",
        );
        assert_eq!(classify_failure(&ep), FailureMode::CostLimit);
    }

    #[test]
    fn test_timeout_without_answer() {
        let ep = failed_episode(vec![TraceEvent::new(TraceKind::Timeout, "deadline")], "");
        assert_eq!(classify_failure(&ep), FailureMode::Timeout);
    }

    #[test]
    fn test_timed_out_but_answered_is_wrong_answer() {
        // An answer was produced before the deadline marker landed; the
        // completed-but-incorrect case takes precedence over the timeout.
        let ep = failed_episode(vec![TraceEvent::new(TraceKind::Timeout, "late")], "42");
        assert_eq!(classify_failure(&ep), FailureMode::WrongAnswer);
    }

    #[test]
    fn test_completed_but_incorrect() {
        let ep = failed_episode(vec![], "not the answer");
        assert_eq!(classify_failure(&ep), FailureMode::WrongAnswer);
    }

    #[test]
    fn test_everything_else_is_crash() {
        let ep = failed_episode(
            vec![TraceEvent::new(TraceKind::ModelError, "boom")],
            "",
        );
        assert_eq!(classify_failure(&ep), FailureMode::Crash);
    }
}
