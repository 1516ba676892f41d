//! Simulated work units.
//!
//! The payload is a stand-in for real work: each unit burns a fixed wall-time
//! budget and, with a configured probability, hits an "issue" that costs an
//! extra delay and counts toward the worker's result. Issues are outcomes to
//! tally, never errors to propagate.

use crate::coord::TaskParams;
use rand::Rng;
use std::time::Duration;

/// Extra delay incurred when a unit hits an issue.
const ISSUE_DELAY_MS: u64 = 50;

/// Perform one bounded unit of work and return the issue delta (0 or 1).
///
/// Units are the atomicity grain of the whole system: callers only observe
/// state between units, never inside one.
pub fn do_work_unit(params: &TaskParams) -> u32 {
    std::thread::sleep(Duration::from_millis(params.unit_ms));
    if params.fail_prob > 0 && rand::thread_rng().gen_range(0..100u32) < u32::from(params.fail_prob)
    {
        std::thread::sleep(Duration::from_millis(ISSUE_DELAY_MS));
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(fail_prob: u8) -> TaskParams {
        TaskParams {
            phases: 1,
            units: 1,
            unit_ms: 0,
            fail_prob,
        }
    }

    #[test]
    fn test_zero_probability_never_reports_issues() {
        for _ in 0..50 {
            assert_eq!(do_work_unit(&params(0)), 0);
        }
    }

    #[test]
    fn test_full_probability_always_reports_issues() {
        for _ in 0..10 {
            assert_eq!(do_work_unit(&params(100)), 1);
        }
    }
}
