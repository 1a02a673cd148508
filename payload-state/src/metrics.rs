// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The metrics sink interface and the stable names reported through it.

use std::time::Duration;

/// Receiver for the metrics the state machine emits when it closes out an
/// attempt, an update, or a boot.
///
/// The histogram shape arguments (`min`, `max`, `buckets`) describe the
/// intended aggregation; a sink that does its own bucketing is free to
/// ignore them.
pub trait MetricsSink: Send + Sync {
    /// Report one sample of an enumerated value in `[0, max)`.
    fn send_enum(&self, name: &str, value: i64, max: i64);

    /// Report one sample of a count.
    fn send_count(
        &self,
        name: &str,
        value: i64,
        min: i64,
        max: i64,
        buckets: u32,
    );

    /// Report one sample of a duration.
    fn send_time(
        &self,
        name: &str,
        value: Duration,
        min: Duration,
        max: Duration,
        buckets: u32,
    );
}

/// Histogram bucket count used unless a metric has a reason to differ.
pub const DEFAULT_BUCKETS: u32 = 50;

/// Wall-clock duration of the applied update, offer to completion.
pub const METRIC_UPDATE_DURATION: &str = "update-client.update-duration";

/// Device uptime spent on the applied update.
pub const METRIC_UPDATE_DURATION_UPTIME: &str =
    "update-client.update-duration-uptime";

/// URL switches during the applied update.
pub const METRIC_URL_SWITCH_COUNT: &str = "update-client.url-switch-count";

/// Whether the applied payload was a full image or a delta; values from
/// [`PayloadType`].
pub const METRIC_PAYLOAD_TYPE: &str = "update-client.payload-type";

/// Attempts the applied update took.
pub const METRIC_PAYLOAD_ATTEMPT_COUNT: &str =
    "update-client.payload-attempt-count";

/// Offers that were superseded before one was applied.
pub const METRIC_UPDATES_ABANDONED_COUNT: &str =
    "update-client.updates-abandoned-count";

/// Reboots that happened while the applied update was in flight.
pub const METRIC_REBOOT_COUNT: &str = "update-client.reboot-count";

/// Boots into the old version while a new one was expected.
pub const METRIC_FAILED_BOOT_ATTEMPTS: &str =
    "update-client.failed-boot-attempts";

/// Wall-clock time from update applied to booted into it.
pub const METRIC_TIME_TO_REBOOT: &str = "update-client.time-to-reboot";

/// Prefix; the full name carries a [`crate::DownloadSource::name`] suffix.
/// Mebibytes downloaded by the successful attempt.
pub const METRIC_CURRENT_MBS_PREFIX: &str =
    "update-client.current-mbs-downloaded.";

/// Prefix; the full name carries a [`crate::DownloadSource::name`] suffix.
/// Mebibytes downloaded since the last applied update.
pub const METRIC_TOTAL_MBS_PREFIX: &str =
    "update-client.total-mbs-downloaded.";

/// Bytes downloaded beyond those of the successful attempt, as a
/// percentage of the successful attempt's bytes.
pub const METRIC_DOWNLOAD_OVERHEAD_PERCENT: &str =
    "update-client.download-overhead-percent";

/// Values reported under [`METRIC_PAYLOAD_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    Delta = 0,
    Full = 1,
}

/// Exclusive upper bound for [`METRIC_PAYLOAD_TYPE`] samples.
pub const PAYLOAD_TYPE_MAX: i64 = 2;
