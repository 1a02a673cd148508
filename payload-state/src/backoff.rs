// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exponential backoff between payload download attempts.
//!
//! The interval is keyed on the *full* payload attempt number: full
//! payloads are what a device falls back to when deltas keep failing, so
//! they are the expensive case worth pacing. Attempt `n` waits
//! `2^(n-1)` days, capped, with a small uniform fuzz so devices that
//! failed together do not all come back together.

use crate::config::Config;
use rand::Rng;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// The unfuzzed backoff interval for full payload attempt number
/// `attempt`, or `None` when no backoff applies (no full attempt has
/// failed yet).
pub(crate) fn base_interval(
    config: &Config,
    attempt: u32,
) -> Option<Duration> {
    if attempt == 0 {
        return None;
    }
    // 2^(attempt - 1) days, saturating well past any realistic cap.
    let days = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let interval = DAY.checked_mul(u32::try_from(days).unwrap_or(u32::MAX));
    Some(interval.unwrap_or(Duration::MAX).min(config.max_backoff))
}

/// Apply `±fuzz` uniform fuzz to an interval.
pub(crate) fn fuzz_interval(interval: Duration, fuzz: f64) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - fuzz..=1.0 + fuzz);
    interval.mul_f64(factor)
}

/// The fuzzed interval to wait after full payload attempt `attempt`, or
/// `None` to clear any backoff.
pub(crate) fn interval(config: &Config, attempt: u32) -> Option<Duration> {
    base_interval(config, attempt)
        .map(|base| fuzz_interval(base, config.backoff_fuzz))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_backoff_before_the_first_failed_attempt() {
        assert_eq!(base_interval(&Config::default(), 0), None);
        assert_eq!(interval(&Config::default(), 0), None);
    }

    #[test]
    fn interval_doubles_then_caps() {
        let config = Config::default();
        let days = |n| base_interval(&config, n).unwrap();
        assert_eq!(days(1), DAY);
        assert_eq!(days(2), 2 * DAY);
        assert_eq!(days(3), 4 * DAY);
        assert_eq!(days(4), 8 * DAY);
        assert_eq!(days(5), 16 * DAY);
        assert_eq!(days(6), 16 * DAY);
        assert_eq!(days(40), 16 * DAY);
    }

    #[test]
    fn shift_does_not_overflow_for_large_attempt_numbers() {
        let config = Config::default();
        assert_eq!(base_interval(&config, u32::MAX), Some(config.max_backoff));
    }

    #[test]
    fn fuzz_stays_within_five_percent() {
        let config = Config::default();
        for attempt in [1, 3, 5, 9] {
            let base = base_interval(&config, attempt).unwrap();
            for _ in 0..100 {
                let fuzzed = interval(&config, attempt).unwrap();
                assert!(fuzzed >= base.mul_f64(0.95), "{fuzzed:?} too short");
                assert!(fuzzed <= base.mul_f64(1.05), "{fuzzed:?} too long");
            }
        }
    }
}
