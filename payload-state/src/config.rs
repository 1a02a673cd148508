// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables for the payload state machine, gathered in one place and passed
//! in at construction.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of a [`crate::PayloadState`].
///
/// The defaults are the values the production client ships with; tests
/// shrink them to keep scenarios short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How many failures we tolerate on a single URL before advancing to
    /// the next candidate.
    pub max_url_failure_count: u32,

    /// Upper bound on the computed backoff interval. The exponential series
    /// stops doubling once it reaches this value.
    pub max_backoff: Duration,

    /// Fraction of uniform fuzz applied to each computed backoff interval,
    /// so that a fleet of devices that failed together does not retry
    /// together.
    pub backoff_fuzz: f64,

    /// Wall-clock adjustments (e.g. NTP steps) can make `now` appear
    /// earlier than a persisted start timestamp. Differences within this
    /// slack are treated as benign; larger ones are logged as drift. Either
    /// way durations are clamped to zero rather than going negative.
    pub duration_slack: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_url_failure_count: 10,
            max_backoff: Duration::from_secs(16 * 24 * 60 * 60),
            backoff_fuzz: 0.05,
            duration_slack: Duration::from_secs(10 * 60),
        }
    }
}
