// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The payload state machine.
//!
//! [`PayloadState`] tracks where a device is between "an update was
//! offered" and "the device rebooted into it": which candidate URL to
//! fetch from next, how many times each has failed, how long to back off,
//! how many bytes each download source has served, and how much wall and
//! uptime the update has consumed. Every mutation is written through to
//! the injected preference stores so the machine resumes mid-flight after
//! a process restart or an unclean reboot; the in-memory copy stays
//! authoritative when a store misbehaves, so persistence trouble degrades
//! durability, never progress.
//!
//! The machine is synchronous and single-threaded by contract: one driver
//! calls the event methods, none of them re-enter, and none of them
//! block. Hosts that dispatch events from multiple tasks must serialize
//! at their boundary.

use crate::backoff;
use crate::config::Config;
use crate::download_source::DownloadSource;
use crate::errors::{ErrorAction, ErrorCode};
use crate::metrics::{self, MetricsSink, PayloadType};
use crate::prefs::{PersistedStore, Prefs, keys, source_key};
use crate::response::UpdateResponse;
use crate::system::{Clock, SystemInfo};
use chrono::{DateTime, TimeDelta, Utc};
use slog::{Logger, error, info, o, warn};
use std::sync::Arc;
use std::time::Duration;

const EPOCH: DateTime<Utc> = DateTime::UNIX_EPOCH;

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Persisted state for payload downloads. See the module docs.
pub struct PayloadState {
    log: Logger,
    config: Config,
    prefs: Prefs,
    clock: Arc<dyn Clock>,
    system: Arc<dyn SystemInfo>,
    metrics: Arc<dyn MetricsSink>,

    /// The offer currently being worked on. In-memory only; after a
    /// restart it is re-established by the next `set_response` call,
    /// which the persisted signature matches against.
    response: Option<UpdateResponse>,
    response_signature: String,

    /// Times the full candidate URL list has been exhausted (or a
    /// download finished) for the current offer.
    payload_attempt_number: u32,

    /// Same, counted only while the offered payload is a full image.
    /// Drives backoff.
    full_payload_attempt_number: u32,

    url_index: usize,
    url_failure_count: u32,
    url_switch_count: u32,

    /// Distinct offers seen since the last applied update.
    num_responses_seen: u32,

    /// Reboots observed while the current update was in flight.
    num_reboots: u32,

    /// Downloads are forbidden before this wall-clock instant.
    backoff_expiry_time: DateTime<Utc>,

    update_timestamp_start: DateTime<Utc>,
    /// In-memory only; epoch while an update is in progress.
    update_timestamp_end: DateTime<Utc>,

    /// Accumulated uptime spent on the current update, folded forward
    /// from `update_duration_uptime_timestamp`.
    update_duration_uptime: Duration,
    /// In-memory only; monotonic reading the accumulator was last folded
    /// at.
    update_duration_uptime_timestamp: Duration,

    /// Bytes downloaded by the current attempt, per source. The last slot
    /// belongs to [`DownloadSource::Unknown`]: writable so stray
    /// accounting is harmless, never persisted or reported.
    current_bytes_downloaded: [u64; DownloadSource::NUM_SLOTS],
    /// Bytes downloaded since the last applied update, per source.
    total_bytes_downloaded: [u64; DownloadSource::NUM_SLOTS],

    /// URLs from the current offer that device policy permits, in offer
    /// order. In-memory only; recomputed on every `set_response`.
    candidate_urls: Vec<crate::response::PayloadUrl>,
    current_download_source: DownloadSource,

    /// OS version blacklisted by an explicit rollback. Lives in the
    /// powerwash-safe store.
    rollback_version: String,
}

impl PayloadState {
    /// Build a machine from whatever state the stores hold, logging the
    /// result. Absent or damaged fields take their defaults.
    pub fn load(
        log: &Logger,
        config: Config,
        normal_prefs: Arc<dyn PersistedStore>,
        powerwash_safe_prefs: Arc<dyn PersistedStore>,
        clock: Arc<dyn Clock>,
        system: Arc<dyn SystemInfo>,
        metrics: Arc<dyn MetricsSink>,
    ) -> PayloadState {
        let log = log.new(o!("component" => "payload-state"));
        let prefs =
            Prefs::new(log.clone(), normal_prefs, powerwash_safe_prefs);
        let now_monotonic = clock.monotonic();
        let mut state = PayloadState {
            log,
            config,
            prefs,
            clock,
            system,
            metrics,
            response: None,
            response_signature: String::new(),
            payload_attempt_number: 0,
            full_payload_attempt_number: 0,
            url_index: 0,
            url_failure_count: 0,
            url_switch_count: 0,
            num_responses_seen: 0,
            num_reboots: 0,
            backoff_expiry_time: EPOCH,
            update_timestamp_start: EPOCH,
            update_timestamp_end: EPOCH,
            update_duration_uptime: Duration::ZERO,
            update_duration_uptime_timestamp: now_monotonic,
            current_bytes_downloaded: [0; DownloadSource::NUM_SLOTS],
            total_bytes_downloaded: [0; DownloadSource::NUM_SLOTS],
            candidate_urls: Vec::new(),
            current_download_source: DownloadSource::Unknown,
            rollback_version: String::new(),
        };
        state.load_persisted_state();
        state.log_initial_state();
        state
    }

    // Event methods, called by the driver.

    /// Install the latest offer from the update server.
    ///
    /// An offer whose signature matches the persisted one is a resume of
    /// the in-flight update: candidate URLs are recomputed (device policy
    /// may have changed) and the URL index is clamped back into range if
    /// the list shrank, but no counter moves. A different signature
    /// supersedes the current update and resets everything scoped to it.
    pub fn set_response(&mut self, response: UpdateResponse) {
        let new_signature = response.signature();
        self.response = Some(response);
        self.compute_candidate_urls();

        if new_signature == self.response_signature {
            info!(self.log, "update offer unchanged; resuming");
            if !self.candidate_urls.is_empty()
                && self.url_index >= self.candidate_urls.len()
            {
                warn!(
                    self.log,
                    "persisted URL index out of range; clamping";
                    "url_index" => self.url_index,
                    "num_candidate_urls" => self.candidate_urls.len(),
                );
                self.set_url_index(0);
            }
            self.update_current_download_source();
            return;
        }

        info!(
            self.log, "new update offer supersedes the current one";
            "num_responses_seen" => self.num_responses_seen + 1,
        );
        self.reset_persisted_state();
        self.set_response_signature(&new_signature);
        self.set_num_responses_seen(self.num_responses_seen + 1);
        self.set_update_timestamp_start(self.clock.wallclock());
        self.update_timestamp_end = EPOCH;
        self.set_update_duration_uptime(
            Duration::ZERO,
            self.clock.monotonic(),
        );
        self.update_current_download_source();
    }

    /// The driver fetched `count` more payload bytes.
    pub fn download_progress(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        self.calculate_update_duration_uptime();
        self.update_bytes_downloaded(count);
        // Bytes flowed, so the current URL works. The failure count only
        // penalizes consecutive failures.
        self.set_url_failure_count(0);
    }

    /// The payload finished downloading.
    pub fn download_complete(&mut self) {
        info!(self.log, "payload downloaded successfully");
        self.increment_payload_attempt_number();
        self.increment_full_payload_attempt_number();
        self.report_bytes_downloaded_metrics();
        self.set_url_failure_count(0);
    }

    /// The update failed with `error`; steer the next attempt
    /// accordingly. See [`ErrorCode::action`] for the classification.
    pub fn update_failed(&mut self, error: ErrorCode) {
        let action = error.action();
        info!(
            self.log, "update failed";
            "error" => ?error,
            "action" => ?action,
        );
        if self.candidate_urls.is_empty() {
            warn!(self.log, "no candidate URLs to penalize for the failure");
            return;
        }
        match action {
            ErrorAction::Ignore => {}
            ErrorAction::RetryUrl => self.increment_failure_count(),
            ErrorAction::NextUrl => self.increment_url_index(),
            ErrorAction::Terminal => {
                self.calculate_update_duration_uptime();
                self.update_timestamp_end = self.clock.wallclock();
                self.report_bytes_downloaded_metrics();
                self.reset_download_sources_on_new_update();
            }
        }
    }

    /// The update was applied. Reports the attempt's metrics, drops every
    /// counter scoped to the update (including the since-last-success
    /// totals), clears any rollback blacklist, and records the updated
    /// marker so the next boot can measure time-to-reboot.
    pub fn update_succeeded(&mut self) {
        self.calculate_update_duration_uptime();
        self.update_timestamp_end = self.clock.wallclock();
        info!(self.log, "update applied successfully");

        self.report_bytes_downloaded_metrics();
        self.report_url_switches_metric();
        self.report_reboot_metric();
        self.report_duration_metrics();
        self.report_updates_abandoned_metric();
        self.report_payload_type_metric();
        self.report_attempts_count_metric();

        self.reset_persisted_state();
        for source in DownloadSource::ALL {
            self.set_total_bytes_downloaded(source, 0);
        }
        self.total_bytes_downloaded[DownloadSource::Unknown.slot()] = 0;
        self.set_num_responses_seen(0);
        self.set_num_reboots(0);
        self.reset_rollback_version();
        self.create_system_updated_marker();
    }

    /// A download that had stopped (process restart, connectivity) is
    /// moving again. Re-anchors uptime accounting; no counter moves.
    pub fn update_resumed(&mut self) {
        info!(self.log, "resuming an update that was previously started");
        self.update_duration_uptime_timestamp = self.clock.monotonic();
    }

    /// The driver is starting over against the same offer: a fresh
    /// attempt with fresh per-attempt accounting.
    pub fn update_restarted(&mut self) {
        info!(self.log, "starting a new update attempt");
        self.reset_download_sources_on_new_update();
        self.set_update_timestamp_start(self.clock.wallclock());
        self.update_timestamp_end = EPOCH;
        self.set_update_duration_uptime(
            Duration::ZERO,
            self.clock.monotonic(),
        );
    }

    /// Forget the in-flight attempt without touching the offer signature
    /// or the since-last-success totals. Calling it twice is the same as
    /// calling it once.
    pub fn reset_update_status(&mut self) {
        info!(self.log, "resetting in-flight update status");
        self.reset_persisted_state();
    }

    /// The device is being rolled back: blacklist the running version so
    /// the next offers of it can be refused, and drop the in-flight
    /// attempt, which the rollback makes moot.
    pub fn rollback(&mut self) {
        let version = self.system.running_os_version();
        info!(self.log, "rolling back"; "version" => %version);
        self.set_rollback_version(&version);
        self.reset_persisted_state();
    }

    /// An update was applied and a reboot into `target_version_uid` is
    /// expected. Persists the target so the next engine start can tell a
    /// successful boot into the update from a failed one.
    pub fn expect_reboot_in_new_version(&mut self, target_version_uid: &str) {
        let previous =
            self.prefs.read_string(keys::TARGET_VERSION_UID, false);
        self.prefs.write_string(
            keys::TARGET_VERSION_UID,
            target_version_uid,
            false,
        );
        if previous.as_deref() != Some(target_version_uid) {
            self.prefs.write_count(keys::TARGET_VERSION_ATTEMPTS, 1, false);
        }
        info!(
            self.log, "expecting to boot into new version";
            "target_version_uid" => target_version_uid,
        );
    }

    /// The engine (re)started: count a reboot if the boot id changed,
    /// consume the updated marker if we just booted into an update, and
    /// report a failed boot if we expected a new version and are still
    /// running the old one.
    pub fn update_engine_started(&mut self) {
        self.update_num_reboots();
        self.consume_system_updated_marker();
        self.report_failed_boot_if_needed();
    }

    /// Whether downloading is currently forbidden by backoff.
    ///
    /// Backoff never applies to interactive (user-requested) updates, to
    /// full payloads the server attached a deadline to, or on unofficial
    /// builds.
    pub fn should_backoff_download(&self) -> bool {
        let Some(response) = &self.response else {
            return false;
        };
        if response.is_interactive {
            return false;
        }
        if !response.is_delta_payload && response.has_install_deadline {
            return false;
        }
        if !self.system.is_official_build() {
            return false;
        }
        self.clock.wallclock() < self.backoff_expiry_time
    }

    // Read-only accessors. All of them are total: they answer from
    // memory with the documented defaults even before any event arrives.

    pub fn response_signature(&self) -> &str {
        &self.response_signature
    }

    pub fn payload_attempt_number(&self) -> u32 {
        self.payload_attempt_number
    }

    pub fn full_payload_attempt_number(&self) -> u32 {
        self.full_payload_attempt_number
    }

    /// The URL downloads should currently use, or `""` when the offer has
    /// no usable URL.
    pub fn current_url(&self) -> String {
        self.candidate_urls
            .get(self.url_index)
            .map(|payload_url| payload_url.url.clone())
            .unwrap_or_default()
    }

    pub fn current_url_index(&self) -> usize {
        self.url_index
    }

    pub fn url_failure_count(&self) -> u32 {
        self.url_failure_count
    }

    pub fn url_switch_count(&self) -> u32 {
        self.url_switch_count
    }

    pub fn num_responses_seen(&self) -> u32 {
        self.num_responses_seen
    }

    pub fn num_reboots(&self) -> u32 {
        self.num_reboots
    }

    pub fn backoff_expiry_time(&self) -> DateTime<Utc> {
        self.backoff_expiry_time
    }

    pub fn current_download_source(&self) -> DownloadSource {
        self.current_download_source
    }

    /// Wall-clock duration of the current update: start to end once a
    /// terminal event happened, start to now while in progress. Clock
    /// steps that would make this negative clamp it to zero.
    pub fn update_duration(&self) -> Duration {
        let end = if self.update_timestamp_end == EPOCH {
            self.clock.wallclock()
        } else {
            self.update_timestamp_end
        };
        let elapsed = end - self.update_timestamp_start;
        match elapsed.to_std() {
            Ok(duration) => duration,
            Err(_) => {
                if elapsed < -to_delta(self.config.duration_slack) {
                    warn!(
                        self.log,
                        "wall clock moved backwards across the update";
                        "start" => %self.update_timestamp_start,
                        "end" => %end,
                    );
                }
                Duration::ZERO
            }
        }
    }

    /// Device uptime spent on the current update: the persisted
    /// accumulator plus whatever has elapsed since it was last folded.
    pub fn update_duration_uptime(&self) -> Duration {
        let since_fold = self
            .clock
            .monotonic()
            .saturating_sub(self.update_duration_uptime_timestamp);
        self.update_duration_uptime + since_fold
    }

    /// Bytes the current attempt has downloaded from `source`.
    pub fn current_bytes_downloaded(&self, source: DownloadSource) -> u64 {
        self.current_bytes_downloaded[source.slot()]
    }

    /// Bytes downloaded from `source` since the last applied update.
    pub fn total_bytes_downloaded(&self, source: DownloadSource) -> u64 {
        self.total_bytes_downloaded[source.slot()]
    }

    /// The version blacklisted by [`PayloadState::rollback`], or `""`.
    /// The caller is the one expected to refuse offers of it.
    pub fn rollback_version(&self) -> &str {
        &self.rollback_version
    }

    // Attempt sequencing.

    /// Advance to the next candidate URL, wrapping to the first once the
    /// list is exhausted. A wrap closes one pass over every URL, which is
    /// what the attempt numbers count, and is when backoff grows.
    fn increment_url_index(&mut self) {
        let next = self.url_index + 1;
        if next < self.candidate_urls.len() {
            self.set_url_index(next);
            info!(
                self.log, "advanced to the next candidate URL";
                "url_index" => next,
            );
        } else {
            self.set_url_index(0);
            info!(self.log, "exhausted candidate URLs; wrapping around");
            self.increment_payload_attempt_number();
            self.increment_full_payload_attempt_number();
            self.update_backoff_expiry_time();
        }
        self.set_url_switch_count(self.url_switch_count + 1);
        self.set_url_failure_count(0);
        self.update_current_download_source();
    }

    /// Count one failure against the current URL, advancing to the next
    /// URL once the configured limit is reached.
    fn increment_failure_count(&mut self) {
        let next = self.url_failure_count + 1;
        if next < self.config.max_url_failure_count {
            self.set_url_failure_count(next);
        } else {
            info!(
                self.log, "URL reached its failure limit";
                "url_index" => self.url_index,
            );
            self.increment_url_index();
        }
    }

    fn increment_payload_attempt_number(&mut self) {
        self.set_payload_attempt_number(self.payload_attempt_number + 1);
    }

    /// Like [`Self::increment_payload_attempt_number`] but only while the
    /// offered payload is a full image; delta failures do not drive
    /// backoff.
    fn increment_full_payload_attempt_number(&mut self) {
        let is_delta = self
            .response
            .as_ref()
            .map_or(false, |response| response.is_delta_payload);
        if is_delta {
            return;
        }
        self.set_full_payload_attempt_number(
            self.full_payload_attempt_number + 1,
        );
    }

    fn update_backoff_expiry_time(&mut self) {
        match backoff::interval(&self.config, self.full_payload_attempt_number)
        {
            None => self.set_backoff_expiry_time(EPOCH),
            Some(interval) => {
                let expiry = self.clock.wallclock() + to_delta(interval);
                info!(
                    self.log, "backing off further downloads";
                    "expiry" => %expiry,
                );
                self.set_backoff_expiry_time(expiry);
            }
        }
    }

    /// Keep the candidates the device-policy predicate permits, in offer
    /// order. Unofficial builds skip the predicate so development images
    /// can fetch from anywhere.
    fn compute_candidate_urls(&mut self) {
        let Some(response) = &self.response else {
            self.candidate_urls.clear();
            return;
        };
        let bypass_policy = !self.system.is_official_build();
        self.candidate_urls = response
            .payload_urls
            .iter()
            .filter(|payload_url| {
                bypass_policy || self.system.is_url_allowed(&payload_url.url)
            })
            .cloned()
            .collect();
        info!(
            self.log, "computed candidate URLs";
            "num_candidates" => self.candidate_urls.len(),
            "num_offered" => response.payload_urls.len(),
        );
    }

    fn update_current_download_source(&mut self) {
        self.current_download_source = self
            .candidate_urls
            .get(self.url_index)
            .map(|payload_url| payload_url.source)
            .unwrap_or(DownloadSource::Unknown);
    }

    /// Zero every field scoped to the current offer. The signature, the
    /// since-last-success totals, the responses-seen and reboot counts,
    /// the update timestamps, and the rollback blacklist all survive.
    fn reset_persisted_state(&mut self) {
        self.set_payload_attempt_number(0);
        self.set_full_payload_attempt_number(0);
        self.set_url_index(0);
        self.set_url_failure_count(0);
        self.set_url_switch_count(0);
        self.set_backoff_expiry_time(EPOCH);
        self.reset_download_sources_on_new_update();
        self.update_current_download_source();
    }

    /// Zero the per-attempt byte counters.
    fn reset_download_sources_on_new_update(&mut self) {
        for source in DownloadSource::ALL {
            self.set_current_bytes_downloaded(source, 0);
        }
        self.current_bytes_downloaded[DownloadSource::Unknown.slot()] = 0;
    }

    // Byte accounting.

    fn update_bytes_downloaded(&mut self, count: u64) {
        let source = self.current_download_source;
        self.set_current_bytes_downloaded(
            source,
            self.current_bytes_downloaded[source.slot()]
                .saturating_add(count),
        );
        self.set_total_bytes_downloaded(
            source,
            self.total_bytes_downloaded[source.slot()].saturating_add(count),
        );
    }

    // Uptime accounting.

    /// Fold the uptime elapsed since the last fold into the persisted
    /// accumulator. Runs on every progress and terminal event so the
    /// persisted value stays close to the truth even across crashes.
    fn calculate_update_duration_uptime(&mut self) {
        let now = self.clock.monotonic();
        let elapsed =
            now.saturating_sub(self.update_duration_uptime_timestamp);
        self.set_update_duration_uptime(
            self.update_duration_uptime + elapsed,
            now,
        );
    }

    // Reboot, boot-failure, and rollback tracking.

    /// Detect a reboot by comparing the current boot id with the one seen
    /// last time the engine started.
    fn update_num_reboots(&mut self) {
        let boot_id = self.system.boot_id();
        match self.prefs.read_string(keys::PREVIOUS_BOOT_ID, false) {
            Some(previous) if previous == boot_id => {}
            Some(_) => {
                self.set_num_reboots(self.num_reboots + 1);
                info!(
                    self.log, "device rebooted";
                    "num_reboots" => self.num_reboots,
                );
                self.prefs.write_string(
                    keys::PREVIOUS_BOOT_ID,
                    &boot_id,
                    false,
                );
            }
            None => {
                self.prefs.write_string(
                    keys::PREVIOUS_BOOT_ID,
                    &boot_id,
                    false,
                );
            }
        }
    }

    /// If the previous process instance recorded that it applied an
    /// update, and we are now running the version it targeted, report how
    /// long the device took to reboot into it. The marker is consumed
    /// either way.
    fn consume_system_updated_marker(&mut self) {
        if !self.prefs.exists(keys::SYSTEM_UPDATED_MARKER, false) {
            return;
        }
        let marker_micros =
            self.prefs.read_count(keys::SYSTEM_UPDATED_MARKER, false);
        self.prefs.delete(keys::SYSTEM_UPDATED_MARKER, false);
        let Some(marker_micros) = marker_micros else {
            return;
        };

        let running = self.system.running_os_version();
        let target = self.prefs.read_string(keys::TARGET_VERSION_UID, false);
        if target.as_deref() != Some(running.as_str()) {
            info!(
                self.log, "updated marker present but not running the target";
                "running" => %running,
            );
            return;
        }
        let Some(updated_at) = DateTime::from_timestamp_micros(marker_micros)
        else {
            return;
        };
        match (self.clock.wallclock() - updated_at).to_std() {
            Ok(time_to_reboot) => self.booted_into_update(time_to_reboot),
            Err(_) => {
                error!(
                    self.log,
                    "wall clock moved backwards across the update reboot";
                    "updated_at" => %updated_at,
                );
            }
        }
    }

    fn booted_into_update(&mut self, time_to_reboot: Duration) {
        info!(
            self.log, "booted into the applied update";
            "time_to_reboot" => ?time_to_reboot,
        );
        self.send_time_metric(
            metrics::METRIC_TIME_TO_REBOOT,
            time_to_reboot,
        );
    }

    /// If we expected to be running a new version by now and are not,
    /// report the failed boot with how many times this payload has tried.
    /// Once the target is reached (or there is none), the bookkeeping is
    /// cleared.
    fn report_failed_boot_if_needed(&mut self) {
        let Some(target) =
            self.prefs.read_string(keys::TARGET_VERSION_UID, false)
        else {
            return;
        };
        if !target.is_empty() && self.system.running_os_version() != target {
            let attempts = self
                .prefs
                .read_count(keys::TARGET_VERSION_ATTEMPTS, false)
                .unwrap_or(0);
            warn!(
                self.log, "expected to boot into a new version but did not";
                "target_version_uid" => %target,
                "attempts" => attempts,
            );
            self.send_count_metric(
                metrics::METRIC_FAILED_BOOT_ATTEMPTS,
                attempts,
            );
            self.prefs.write_count(
                keys::TARGET_VERSION_ATTEMPTS,
                attempts.saturating_add(1),
                false,
            );
        } else {
            self.prefs.delete(keys::TARGET_VERSION_UID, false);
            self.prefs.delete(keys::TARGET_VERSION_ATTEMPTS, false);
        }
    }

    /// Record when the update was applied, for the next boot to measure
    /// time-to-reboot against.
    fn create_system_updated_marker(&mut self) {
        let now = self.clock.wallclock();
        self.prefs.write_count(
            keys::SYSTEM_UPDATED_MARKER,
            now.timestamp_micros(),
            false,
        );
    }

    fn set_rollback_version(&mut self, version: &str) {
        self.rollback_version = version.to_string();
        self.prefs.write_string(keys::ROLLBACK_VERSION, version, true);
    }

    fn reset_rollback_version(&mut self) {
        self.rollback_version.clear();
        self.prefs.delete(keys::ROLLBACK_VERSION, true);
    }

    // Persisting setters. Each keeps the in-memory value authoritative
    // and treats the store as best-effort.

    fn set_response_signature(&mut self, signature: &str) {
        self.response_signature = signature.to_string();
        self.prefs.write_string(keys::RESPONSE_SIGNATURE, signature, false);
    }

    fn set_payload_attempt_number(&mut self, value: u32) {
        self.payload_attempt_number = value;
        self.prefs.write_count(
            keys::PAYLOAD_ATTEMPT_NUMBER,
            i64::from(value),
            false,
        );
    }

    fn set_full_payload_attempt_number(&mut self, value: u32) {
        self.full_payload_attempt_number = value;
        self.prefs.write_count(
            keys::FULL_PAYLOAD_ATTEMPT_NUMBER,
            i64::from(value),
            false,
        );
    }

    fn set_url_index(&mut self, value: usize) {
        self.url_index = value;
        self.prefs.write_count(
            keys::CURRENT_URL_INDEX,
            i64::try_from(value).unwrap_or(i64::MAX),
            false,
        );
    }

    fn set_url_failure_count(&mut self, value: u32) {
        self.url_failure_count = value;
        self.prefs.write_count(
            keys::CURRENT_URL_FAILURE_COUNT,
            i64::from(value),
            false,
        );
    }

    fn set_url_switch_count(&mut self, value: u32) {
        self.url_switch_count = value;
        self.prefs.write_count(
            keys::URL_SWITCH_COUNT,
            i64::from(value),
            false,
        );
    }

    fn set_num_responses_seen(&mut self, value: u32) {
        self.num_responses_seen = value;
        self.prefs.write_count(
            keys::NUM_RESPONSES_SEEN,
            i64::from(value),
            false,
        );
    }

    fn set_num_reboots(&mut self, value: u32) {
        self.num_reboots = value;
        self.prefs.write_count(keys::NUM_REBOOTS, i64::from(value), false);
    }

    fn set_backoff_expiry_time(&mut self, value: DateTime<Utc>) {
        // Truncate to the persisted granularity so a reload sees exactly
        // the value this process was using.
        let micros = value.timestamp_micros();
        self.backoff_expiry_time =
            DateTime::from_timestamp_micros(micros).unwrap_or(EPOCH);
        self.prefs.write_count(keys::BACKOFF_EXPIRY_TIME, micros, false);
    }

    fn set_update_timestamp_start(&mut self, value: DateTime<Utc>) {
        let micros = value.timestamp_micros();
        self.update_timestamp_start =
            DateTime::from_timestamp_micros(micros).unwrap_or(EPOCH);
        self.prefs.write_count(keys::UPDATE_TIMESTAMP_START, micros, false);
    }

    fn set_update_duration_uptime(
        &mut self,
        value: Duration,
        anchor: Duration,
    ) {
        self.update_duration_uptime = value;
        self.update_duration_uptime_timestamp = anchor;
        self.prefs.write_count(
            keys::UPDATE_DURATION_UPTIME,
            i64::try_from(value.as_micros()).unwrap_or(i64::MAX),
            false,
        );
    }

    fn set_current_bytes_downloaded(
        &mut self,
        source: DownloadSource,
        value: u64,
    ) {
        self.current_bytes_downloaded[source.slot()] = value;
        if source != DownloadSource::Unknown {
            self.prefs.write_count(
                &source_key(keys::CURRENT_BYTES_DOWNLOADED_PREFIX, source),
                i64::try_from(value).unwrap_or(i64::MAX),
                false,
            );
        }
    }

    fn set_total_bytes_downloaded(
        &mut self,
        source: DownloadSource,
        value: u64,
    ) {
        self.total_bytes_downloaded[source.slot()] = value;
        if source != DownloadSource::Unknown {
            self.prefs.write_count(
                &source_key(keys::TOTAL_BYTES_DOWNLOADED_PREFIX, source),
                i64::try_from(value).unwrap_or(i64::MAX),
                false,
            );
        }
    }

    // Loading.

    fn load_persisted_state(&mut self) {
        self.response_signature = self
            .prefs
            .read_string(keys::RESPONSE_SIGNATURE, false)
            .unwrap_or_default();
        self.payload_attempt_number =
            self.load_u32(keys::PAYLOAD_ATTEMPT_NUMBER);
        self.full_payload_attempt_number =
            self.load_u32(keys::FULL_PAYLOAD_ATTEMPT_NUMBER);
        self.url_index = self
            .prefs
            .read_count(keys::CURRENT_URL_INDEX, false)
            .and_then(|value| usize::try_from(value).ok())
            .unwrap_or(0);
        self.url_failure_count =
            self.load_u32(keys::CURRENT_URL_FAILURE_COUNT);
        self.url_switch_count = self.load_u32(keys::URL_SWITCH_COUNT);
        self.num_responses_seen = self.load_u32(keys::NUM_RESPONSES_SEEN);
        self.num_reboots = self.load_u32(keys::NUM_REBOOTS);
        self.load_backoff_expiry_time();
        self.load_update_timestamp_start();
        self.update_duration_uptime = self
            .prefs
            .read_count(keys::UPDATE_DURATION_UPTIME, false)
            .map(|micros| Duration::from_micros(micros as u64))
            .unwrap_or(Duration::ZERO);
        for source in DownloadSource::ALL {
            self.current_bytes_downloaded[source.slot()] = self
                .prefs
                .read_count(
                    &source_key(keys::CURRENT_BYTES_DOWNLOADED_PREFIX, source),
                    false,
                )
                .map(|value| value as u64)
                .unwrap_or(0);
            self.total_bytes_downloaded[source.slot()] = self
                .prefs
                .read_count(
                    &source_key(keys::TOTAL_BYTES_DOWNLOADED_PREFIX, source),
                    false,
                )
                .map(|value| value as u64)
                .unwrap_or(0);
        }
        self.rollback_version = self
            .prefs
            .read_string(keys::ROLLBACK_VERSION, true)
            .unwrap_or_default();
    }

    fn load_u32(&self, key: &str) -> u32 {
        self.prefs
            .read_count(key, false)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(0)
    }

    /// Load the backoff expiry, discarding values a clock jump has pushed
    /// further out than any interval we could have computed. Values in
    /// the past are inert and kept as-is.
    fn load_backoff_expiry_time(&mut self) {
        let Some(micros) =
            self.prefs.read_count(keys::BACKOFF_EXPIRY_TIME, false)
        else {
            return;
        };
        let Some(expiry) = DateTime::from_timestamp_micros(micros) else {
            return;
        };
        let ceiling = self.clock.wallclock()
            + to_delta(
                self.config
                    .max_backoff
                    .mul_f64(1.0 + self.config.backoff_fuzz),
            );
        if expiry > ceiling {
            warn!(
                self.log,
                "persisted backoff expiry is implausibly far out; \
                 discarding";
                "expiry" => %expiry,
            );
            self.set_backoff_expiry_time(EPOCH);
        } else {
            self.backoff_expiry_time = expiry;
        }
    }

    /// An absent start timestamp means this is the first run (or the
    /// store was wiped): the update effectively starts now, and that is
    /// persisted so restarts keep measuring from the same instant.
    fn load_update_timestamp_start(&mut self) {
        let loaded = self
            .prefs
            .read_count(keys::UPDATE_TIMESTAMP_START, false)
            .and_then(DateTime::from_timestamp_micros);
        match loaded {
            Some(start) => self.update_timestamp_start = start,
            None => {
                self.set_update_timestamp_start(self.clock.wallclock());
            }
        }
    }

    fn log_initial_state(&self) {
        info!(
            self.log, "loaded payload state";
            "response_signature" => %self.response_signature,
            "payload_attempt_number" => self.payload_attempt_number,
            "full_payload_attempt_number" => self.full_payload_attempt_number,
            "url_index" => self.url_index,
            "url_failure_count" => self.url_failure_count,
            "url_switch_count" => self.url_switch_count,
            "num_responses_seen" => self.num_responses_seen,
            "num_reboots" => self.num_reboots,
            "backoff_expiry_time" => %self.backoff_expiry_time,
            "update_timestamp_start" => %self.update_timestamp_start,
            "update_duration_uptime" => ?self.update_duration_uptime,
            "rollback_version" => %self.rollback_version,
        );
    }

    // Metrics.

    fn send_count_metric(&self, name: &str, value: i64) {
        self.metrics.send_count(
            name,
            value,
            0,
            10_000,
            metrics::DEFAULT_BUCKETS,
        );
    }

    fn send_time_metric(&self, name: &str, value: Duration) {
        self.metrics.send_time(
            name,
            value,
            Duration::from_secs(1),
            Duration::from_secs(30 * 24 * 60 * 60),
            metrics::DEFAULT_BUCKETS,
        );
    }

    /// Report the per-source byte counters: mebibytes for the current
    /// attempt and since the last applied update, plus the overhead the
    /// retries cost as a percentage of the bytes the successful attempt
    /// needed.
    fn report_bytes_downloaded_metrics(&self) {
        let mib = |bytes: u64| {
            i64::try_from(bytes / (1024 * 1024)).unwrap_or(i64::MAX)
        };
        let mut current_all: u64 = 0;
        let mut total_all: u64 = 0;
        for source in DownloadSource::ALL {
            let current = self.current_bytes_downloaded[source.slot()];
            let total = self.total_bytes_downloaded[source.slot()];
            current_all = current_all.saturating_add(current);
            total_all = total_all.saturating_add(total);
            if current > 0 {
                self.send_count_metric(
                    &format!(
                        "{}{}",
                        metrics::METRIC_CURRENT_MBS_PREFIX,
                        source.name()
                    ),
                    mib(current),
                );
            }
            if total > 0 {
                self.send_count_metric(
                    &format!(
                        "{}{}",
                        metrics::METRIC_TOTAL_MBS_PREFIX,
                        source.name()
                    ),
                    mib(total),
                );
            }
        }
        if current_all > 0 {
            let overhead = total_all
                .saturating_sub(current_all)
                .saturating_mul(100)
                / current_all;
            self.send_count_metric(
                metrics::METRIC_DOWNLOAD_OVERHEAD_PERCENT,
                i64::try_from(overhead).unwrap_or(i64::MAX),
            );
        }
    }

    fn report_url_switches_metric(&self) {
        self.send_count_metric(
            metrics::METRIC_URL_SWITCH_COUNT,
            i64::from(self.url_switch_count),
        );
    }

    fn report_reboot_metric(&self) {
        self.send_count_metric(
            metrics::METRIC_REBOOT_COUNT,
            i64::from(self.num_reboots),
        );
    }

    fn report_duration_metrics(&self) {
        self.send_time_metric(
            metrics::METRIC_UPDATE_DURATION,
            self.update_duration(),
        );
        self.send_time_metric(
            metrics::METRIC_UPDATE_DURATION_UPTIME,
            self.update_duration_uptime(),
        );
    }

    fn report_updates_abandoned_metric(&self) {
        self.send_count_metric(
            metrics::METRIC_UPDATES_ABANDONED_COUNT,
            i64::from(self.num_responses_seen.saturating_sub(1)),
        );
    }

    fn report_payload_type_metric(&self) {
        let payload_type = match &self.response {
            Some(response) if response.is_delta_payload => PayloadType::Delta,
            _ => PayloadType::Full,
        };
        self.metrics.send_enum(
            metrics::METRIC_PAYLOAD_TYPE,
            payload_type as i64,
            metrics::PAYLOAD_TYPE_MAX,
        );
    }

    fn report_attempts_count_metric(&self) {
        self.send_count_metric(
            metrics::METRIC_PAYLOAD_ATTEMPT_COUNT,
            i64::from(self.payload_attempt_number),
        );
    }
}
