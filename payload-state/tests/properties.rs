// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests driving the payload state machine with arbitrary
//! event sequences.

use payload_state::{
    Clock, Config, DownloadSource, ErrorCode, PayloadUrl, UpdateResponse,
};
use payload_state_test_utils::PayloadStateTestContext;
use proptest::prelude::*;
use std::time::Duration;
use test_strategy::{Arbitrary, proptest};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn error_code() -> impl Strategy<Value = ErrorCode> {
    prop::sample::select(vec![
        ErrorCode::Success,
        ErrorCode::Error,
        ErrorCode::ServerRejection,
        ErrorCode::DownloadTransferError,
        ErrorCode::DownloadWriteError,
        ErrorCode::PayloadHashMismatch,
        ErrorCode::PayloadSizeMismatch,
        ErrorCode::MetadataSignatureMismatch,
        ErrorCode::SignedDeltaPayloadExpected,
        ErrorCode::InstallDeviceOpenError,
        ErrorCode::OutOfSpace,
        ErrorCode::PostponedPerPolicy,
    ])
}

/// Everything a driver can throw at the machine.
#[derive(Debug, Clone, Arbitrary)]
enum DriverEvent {
    #[weight(4)]
    Fail(#[strategy(error_code())] ErrorCode),
    #[weight(2)]
    Progress(#[strategy(1u64..4_000_000u64)] u64),
    Complete,
    Succeeded,
    Resumed,
    Restarted,
    ResetStatus,
    EngineStarted,
    Rollback,
    /// Deliver an offer with this many URLs. The same count is the same
    /// offer; different counts supersede each other.
    #[weight(2)]
    Offer(#[strategy(0usize..4usize)] usize),
}

fn offer_with_urls(num_urls: usize) -> UpdateResponse {
    UpdateResponse {
        version: format!("100{num_urls}.0.0"),
        payload_size: 100 << 20,
        payload_hash: "0c67a9".to_string(),
        metadata_size: 1000,
        metadata_signature: "bWV0YQ==".to_string(),
        payload_urls: (0..num_urls)
            .map(|i| PayloadUrl {
                url: format!("https://u{i}.updates.example.com/payload"),
                failure_limit: 10,
                source: DownloadSource::HttpsServer,
            })
            .collect(),
        is_delta_payload: false,
        is_interactive: false,
        has_install_deadline: false,
    }
}

fn apply(ctx: &mut PayloadStateTestContext, event: &DriverEvent) {
    match event {
        DriverEvent::Fail(code) => ctx.state.update_failed(*code),
        DriverEvent::Progress(count) => ctx.state.download_progress(*count),
        DriverEvent::Complete => ctx.state.download_complete(),
        DriverEvent::Succeeded => ctx.state.update_succeeded(),
        DriverEvent::Resumed => ctx.state.update_resumed(),
        DriverEvent::Restarted => ctx.state.update_restarted(),
        DriverEvent::ResetStatus => ctx.state.reset_update_status(),
        DriverEvent::EngineStarted => ctx.state.update_engine_started(),
        DriverEvent::Rollback => ctx.state.rollback(),
        DriverEvent::Offer(num_urls) => {
            ctx.state.set_response(offer_with_urls(*num_urls));
        }
    }
}

#[proptest(cases = 64)]
fn url_index_stays_in_range_and_success_clears_everything(
    #[strategy(proptest::collection::vec(any::<DriverEvent>(), 0..80))]
    events: Vec<DriverEvent>,
) {
    let config = Config { max_url_failure_count: 2, ..Default::default() };
    let mut ctx = PayloadStateTestContext::new("event_soup", config.clone());
    let mut num_candidate_urls = 0usize;

    for event in &events {
        apply(&mut ctx, event);
        if let DriverEvent::Offer(num_urls) = event {
            num_candidate_urls = *num_urls;
        }

        // The URL index is always usable.
        prop_assert!(
            ctx.state.current_url_index() < num_candidate_urls.max(1),
            "url_index {} escaped a {}-URL candidate list",
            ctx.state.current_url_index(),
            num_candidate_urls,
        );
        if num_candidate_urls == 0 {
            prop_assert_eq!(ctx.state.current_url(), "");
        }

        // The failure count never exceeds the configured limit.
        prop_assert!(
            ctx.state.url_failure_count() < config.max_url_failure_count
        );

        // Applying an update leaves nothing behind.
        if matches!(event, DriverEvent::Succeeded) {
            prop_assert_eq!(ctx.state.payload_attempt_number(), 0);
            prop_assert_eq!(ctx.state.full_payload_attempt_number(), 0);
            prop_assert_eq!(ctx.state.current_url_index(), 0);
            prop_assert_eq!(ctx.state.url_failure_count(), 0);
            prop_assert_eq!(ctx.state.url_switch_count(), 0);
            prop_assert_eq!(ctx.state.num_responses_seen(), 0);
            prop_assert_eq!(ctx.state.num_reboots(), 0);
            prop_assert_eq!(ctx.state.rollback_version(), "");
            for source in DownloadSource::ALL {
                prop_assert_eq!(ctx.state.current_bytes_downloaded(source), 0);
                prop_assert_eq!(ctx.state.total_bytes_downloaded(source), 0);
            }
        }
    }
}

#[proptest(cases = 64)]
fn consecutive_retryable_failures_switch_urls_in_threshold_steps(
    #[strategy(1u32..=5u32)] threshold: u32,
    #[strategy(0usize..48usize)] failures: usize,
) {
    let config =
        Config { max_url_failure_count: threshold, ..Default::default() };
    let mut ctx = PayloadStateTestContext::new("threshold_steps", config);
    ctx.state.set_response(offer_with_urls(3));

    for _ in 0..failures {
        ctx.state.update_failed(ErrorCode::DownloadTransferError);
    }

    // Every `threshold` consecutive failures advances the index once.
    prop_assert_eq!(
        ctx.state.url_switch_count() as usize,
        failures / threshold as usize
    );
    prop_assert_eq!(
        ctx.state.url_failure_count() as usize,
        failures % threshold as usize
    );
}

#[proptest(cases = 16)]
fn backoff_doubles_per_wrap_with_bounded_fuzz(
    #[strategy(1u32..=8u32)] wraps: u32,
) {
    let config = Config { max_url_failure_count: 1, ..Default::default() };
    let mut ctx = PayloadStateTestContext::new("backoff_bounds", config);
    ctx.state.set_response(offer_with_urls(1));

    for n in 1..=wraps {
        ctx.state.update_failed(ErrorCode::DownloadTransferError);
        prop_assert_eq!(ctx.state.full_payload_attempt_number(), n);

        let wait = (ctx.state.backoff_expiry_time() - ctx.clock.wallclock())
            .to_std()
            .expect("expiry must be in the future");
        let base = DAY * 2u32.pow(n - 1).min(16);
        prop_assert!(
            wait >= base.mul_f64(0.95),
            "attempt {}: backoff {:?} below the fuzz band of {:?}",
            n,
            wait,
            base,
        );
        prop_assert!(
            wait <= base.mul_f64(1.05),
            "attempt {}: backoff {:?} above the fuzz band of {:?}",
            n,
            wait,
            base,
        );
    }
}

#[proptest(cases = 32)]
fn a_process_restart_changes_nothing_persisted(
    #[strategy(proptest::collection::vec(any::<DriverEvent>(), 0..40))]
    events: Vec<DriverEvent>,
) {
    let config = Config { max_url_failure_count: 2, ..Default::default() };
    let mut ctx = PayloadStateTestContext::new("restart_roundtrip", config);
    for event in &events {
        apply(&mut ctx, event);
    }

    let before = (
        ctx.state.response_signature().to_string(),
        ctx.state.payload_attempt_number(),
        ctx.state.full_payload_attempt_number(),
        ctx.state.current_url_index(),
        ctx.state.url_failure_count(),
        ctx.state.url_switch_count(),
        ctx.state.num_responses_seen(),
        ctx.state.num_reboots(),
        ctx.state.backoff_expiry_time(),
        DownloadSource::ALL
            .map(|source| ctx.state.current_bytes_downloaded(source)),
        DownloadSource::ALL
            .map(|source| ctx.state.total_bytes_downloaded(source)),
        ctx.state.rollback_version().to_string(),
    );

    let ctx = ctx.restart();
    let after = (
        ctx.state.response_signature().to_string(),
        ctx.state.payload_attempt_number(),
        ctx.state.full_payload_attempt_number(),
        ctx.state.current_url_index(),
        ctx.state.url_failure_count(),
        ctx.state.url_switch_count(),
        ctx.state.num_responses_seen(),
        ctx.state.num_reboots(),
        ctx.state.backoff_expiry_time(),
        DownloadSource::ALL
            .map(|source| ctx.state.current_bytes_downloaded(source)),
        DownloadSource::ALL
            .map(|source| ctx.state.total_bytes_downloaded(source)),
        ctx.state.rollback_version().to_string(),
    );

    prop_assert_eq!(before, after);
}
