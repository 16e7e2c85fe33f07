//! Feedback control policy
//!
//! Decides what happens to a candidate once its VMAF score is known: keep it,
//! encode again at a lower (stricter) cq, or stop because the cq range is used up.

use serde::Serialize;

/// Outcome of a quality check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "cq")]
pub enum Decision {
    /// Score meets the threshold; the candidate is final
    Accept,
    /// Score too low; encode again with this cq
    Retry(u32),
    /// Score too low and no lower cq is left; the last candidate is kept
    Abandon,
}

/// Pure decision step of the quality feedback loop.
///
/// Lower cq means higher quality, so each retry subtracts `step`. Starting from
/// `initial`, a task sees at most `initial / step + 1` decisions. A `step` of 0
/// could never make progress and is treated as exhausted.
pub fn decide(score: f64, threshold: f64, current_cq: u32, step: u32) -> Decision {
    if score >= threshold {
        return Decision::Accept;
    }

    if step == 0 {
        return Decision::Abandon;
    }

    match current_cq.checked_sub(step) {
        Some(next) => Decision::Retry(next),
        None => Decision::Abandon,
    }
}

/// Worst-case number of encode attempts for one file.
pub fn max_attempts(initial_cq: u32, step: u32) -> u32 {
    if step == 0 {
        1
    } else {
        initial_cq / step + 1
    }
}
