// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow capability interfaces the state machine consumes.
//!
//! The machine deliberately takes these as separate traits rather than one
//! wide "system state" object: each caller hands in exactly the
//! capabilities it is willing to vouch for, and tests fake them
//! independently.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// The two clocks the machine reads.
///
/// Wall-clock time is used for anything persisted across reboots (backoff
/// expiry, update start, the updated marker); it can jump when NTP steps
/// the clock. The monotonic clock is used for uptime accounting and is
/// exposed as a reading since an unspecified fixed origin so that fakes can
/// drive it directly.
pub trait Clock: Send + Sync {
    fn wallclock(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Duration;
}

/// Facts about the running system, plus the device-policy URL predicate.
pub trait SystemInfo: Send + Sync {
    /// An opaque identifier regenerated on every boot.
    fn boot_id(&self) -> String;

    /// The OS version currently running.
    fn running_os_version(&self) -> String;

    /// Whether this is an official (signed, production) build. Unofficial
    /// images skip download backoff and URL policy filtering so developers
    /// are not slowed down by fleet-protection behavior.
    fn is_official_build(&self) -> bool;

    /// Device-policy predicate: may this URL be used for downloads?
    fn is_url_allowed(&self, url: &str) -> bool;
}

/// The process's real clocks.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> SystemClock {
        SystemClock { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> SystemClock {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn wallclock(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.origin.elapsed()
    }
}
