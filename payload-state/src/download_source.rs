// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The closed set of sources payload bytes can be fetched from.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the bytes of the current download attempt are coming from.
///
/// The per-source byte counters are persisted under keys derived from
/// [`DownloadSource::name`], so the names here are stable across versions
/// of the client.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum DownloadSource {
    /// The payload server, over TLS.
    HttpsServer,
    /// The payload server over plain HTTP, where device policy allows it.
    HttpServer,
    /// A nearby peer re-serving a payload it already holds.
    HttpPeer,
    /// Sentinel for "no current source". It owns the extra slot in the byte
    /// counter arrays: accounting against it is accepted and dropped, and
    /// its counters are never persisted or read back out.
    #[default]
    Unknown,
}

impl DownloadSource {
    /// The real sources, in persistence order.
    pub const ALL: [DownloadSource; 3] = [
        DownloadSource::HttpsServer,
        DownloadSource::HttpServer,
        DownloadSource::HttpPeer,
    ];

    /// Number of byte-counter slots, including the sentinel slot.
    pub const NUM_SLOTS: usize = 4;

    /// Index of this source's slot in the byte counter arrays.
    pub fn slot(self) -> usize {
        match self {
            DownloadSource::HttpsServer => 0,
            DownloadSource::HttpServer => 1,
            DownloadSource::HttpPeer => 2,
            DownloadSource::Unknown => 3,
        }
    }

    /// Stable name used as the suffix of the per-source persisted keys and
    /// metric names.
    pub fn name(self) -> &'static str {
        match self {
            DownloadSource::HttpsServer => "HttpsServer",
            DownloadSource::HttpServer => "HttpServer",
            DownloadSource::HttpPeer => "HttpPeer",
            DownloadSource::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_distinct_and_in_bounds() {
        let mut seen = [false; DownloadSource::NUM_SLOTS];
        for source in
            DownloadSource::ALL.into_iter().chain([DownloadSource::Unknown])
        {
            let slot = source.slot();
            assert!(slot < DownloadSource::NUM_SLOTS);
            assert!(!seen[slot], "slot {slot} assigned twice");
            seen[slot] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn sentinel_is_not_a_real_source() {
        assert!(!DownloadSource::ALL.contains(&DownloadSource::Unknown));
    }
}
