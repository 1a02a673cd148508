// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for the payload-state test suite: a test logger and fake
//! implementations of every interface the state machine consumes. These
//! should not be used in production code.

use chrono::{DateTime, TimeZone, Utc};
use payload_state::metrics::MetricsSink;
use payload_state::{
    Clock, Config, PayloadState, PersistedStore, PrefsError, SystemInfo,
};
use slog::{Drain, Logger, o};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Set up a `slog::Logger` appropriate for a test named `test_name`.
pub fn test_setup_log(test_name: &'static str) -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("component" => test_name))
}

/// A controllable pair of clocks.
///
/// `advance` moves both clocks, like real time passing; `set_wallclock`
/// steps only the wall clock, like NTP.
#[derive(Debug)]
pub struct FakeClock {
    inner: Mutex<FakeClockInner>,
}

#[derive(Debug)]
struct FakeClockInner {
    wallclock: DateTime<Utc>,
    monotonic: Duration,
}

impl FakeClock {
    pub fn new() -> FakeClock {
        FakeClock {
            inner: Mutex::new(FakeClockInner {
                wallclock: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                // A nonzero origin, so tests notice code that confuses
                // "monotonic reading" with "duration since start".
                monotonic: Duration::from_secs(60 * 60),
            }),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.wallclock += chrono::TimeDelta::from_std(duration).unwrap();
        inner.monotonic += duration;
    }

    pub fn set_wallclock(&self, wallclock: DateTime<Utc>) {
        self.inner.lock().unwrap().wallclock = wallclock;
    }
}

impl Default for FakeClock {
    fn default() -> FakeClock {
        FakeClock::new()
    }
}

impl Clock for FakeClock {
    fn wallclock(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().wallclock
    }

    fn monotonic(&self) -> Duration {
        self.inner.lock().unwrap().monotonic
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PrefValue {
    Int(i64),
    String(String),
    Bool(bool),
}

/// In-memory [`PersistedStore`] with injectable write failures.
#[derive(Debug, Default)]
pub struct FakePrefs {
    values: Mutex<BTreeMap<String, PrefValue>>,
    fail_writes: AtomicBool,
}

impl FakePrefs {
    pub fn new() -> FakePrefs {
        FakePrefs::default()
    }

    /// Make every subsequent write and delete fail, to exercise the
    /// machine's fire-and-forget persistence policy.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn write(&self, key: &str, value: PrefValue) -> Result<(), PrefsError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(PrefsError::Io {
                key: key.to_string(),
                err: std::io::Error::other("injected write failure"),
            });
        }
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

impl PersistedStore for FakePrefs {
    fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError> {
        match self.values.lock().unwrap().get(key) {
            None => Ok(None),
            Some(PrefValue::Int(value)) => Ok(Some(*value)),
            Some(_) => Err(PrefsError::WrongType { key: key.to_string() }),
        }
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.write(key, PrefValue::Int(value))
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError> {
        match self.values.lock().unwrap().get(key) {
            None => Ok(None),
            Some(PrefValue::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(PrefsError::WrongType { key: key.to_string() }),
        }
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        self.write(key, PrefValue::String(value.to_string()))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError> {
        match self.values.lock().unwrap().get(key) {
            None => Ok(None),
            Some(PrefValue::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(PrefsError::WrongType { key: key.to_string() }),
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.write(key, PrefValue::Bool(value))
    }

    fn exists(&self, key: &str) -> Result<bool, PrefsError> {
        Ok(self.values.lock().unwrap().contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<(), PrefsError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(PrefsError::Io {
                key: key.to_string(),
                err: std::io::Error::other("injected delete failure"),
            });
        }
        self.values.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Controllable [`SystemInfo`].
///
/// The URL predicate models the one policy production devices actually
/// carry: whether plain-HTTP downloads are allowed.
#[derive(Debug)]
pub struct FakeSystemInfo {
    boot_id: Mutex<String>,
    os_version: Mutex<String>,
    official_build: AtomicBool,
    http_allowed: AtomicBool,
}

impl FakeSystemInfo {
    pub fn new() -> FakeSystemInfo {
        FakeSystemInfo {
            boot_id: Mutex::new("boot-0".to_string()),
            os_version: Mutex::new("1.0.0".to_string()),
            official_build: AtomicBool::new(true),
            http_allowed: AtomicBool::new(true),
        }
    }

    /// Simulate a reboot by changing the boot id.
    pub fn set_boot_id(&self, boot_id: &str) {
        *self.boot_id.lock().unwrap() = boot_id.to_string();
    }

    pub fn set_os_version(&self, version: &str) {
        *self.os_version.lock().unwrap() = version.to_string();
    }

    pub fn set_official_build(&self, official: bool) {
        self.official_build.store(official, Ordering::Relaxed);
    }

    pub fn set_http_allowed(&self, allowed: bool) {
        self.http_allowed.store(allowed, Ordering::Relaxed);
    }
}

impl Default for FakeSystemInfo {
    fn default() -> FakeSystemInfo {
        FakeSystemInfo::new()
    }
}

impl SystemInfo for FakeSystemInfo {
    fn boot_id(&self) -> String {
        self.boot_id.lock().unwrap().clone()
    }

    fn running_os_version(&self) -> String {
        self.os_version.lock().unwrap().clone()
    }

    fn is_official_build(&self) -> bool {
        self.official_build.load(Ordering::Relaxed)
    }

    fn is_url_allowed(&self, url: &str) -> bool {
        self.http_allowed.load(Ordering::Relaxed)
            || !url.starts_with("http://")
    }
}

/// One metric observed by [`MetricsRecorder`]. The histogram shape
/// arguments are dropped; tests care about names and values.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedMetric {
    Enum { name: String, value: i64, max: i64 },
    Count { name: String, value: i64 },
    Time { name: String, value: Duration },
}

/// A [`MetricsSink`] that remembers everything sent to it.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    recorded: Mutex<Vec<RecordedMetric>>,
}

impl MetricsRecorder {
    pub fn new() -> MetricsRecorder {
        MetricsRecorder::default()
    }

    pub fn recorded(&self) -> Vec<RecordedMetric> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.recorded.lock().unwrap().clear();
    }

    /// Values of every count sample sent under `name`, in order.
    pub fn counts(&self, name: &str) -> Vec<i64> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter_map(|metric| match metric {
                RecordedMetric::Count { name: n, value } if n == name => {
                    Some(*value)
                }
                _ => None,
            })
            .collect()
    }

    /// Values of every duration sample sent under `name`, in order.
    pub fn times(&self, name: &str) -> Vec<Duration> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter_map(|metric| match metric {
                RecordedMetric::Time { name: n, value } if n == name => {
                    Some(*value)
                }
                _ => None,
            })
            .collect()
    }

    /// Values of every enum sample sent under `name`, in order.
    pub fn enums(&self, name: &str) -> Vec<i64> {
        self.recorded
            .lock()
            .unwrap()
            .iter()
            .filter_map(|metric| match metric {
                RecordedMetric::Enum { name: n, value, .. } if n == name => {
                    Some(*value)
                }
                _ => None,
            })
            .collect()
    }
}

impl MetricsSink for MetricsRecorder {
    fn send_enum(&self, name: &str, value: i64, max: i64) {
        self.recorded.lock().unwrap().push(RecordedMetric::Enum {
            name: name.to_string(),
            value,
            max,
        });
    }

    fn send_count(
        &self,
        name: &str,
        value: i64,
        _min: i64,
        _max: i64,
        _buckets: u32,
    ) {
        self.recorded.lock().unwrap().push(RecordedMetric::Count {
            name: name.to_string(),
            value,
        });
    }

    fn send_time(
        &self,
        name: &str,
        value: Duration,
        _min: Duration,
        _max: Duration,
        _buckets: u32,
    ) {
        self.recorded.lock().unwrap().push(RecordedMetric::Time {
            name: name.to_string(),
            value,
        });
    }
}

/// Everything a payload-state test needs, wired together: fakes for all
/// of the consumed interfaces and a machine loaded against them.
pub struct PayloadStateTestContext {
    pub log: Logger,
    pub config: Config,
    pub prefs: Arc<FakePrefs>,
    pub powerwash_prefs: Arc<FakePrefs>,
    pub clock: Arc<FakeClock>,
    pub system: Arc<FakeSystemInfo>,
    pub metrics: Arc<MetricsRecorder>,
    pub state: PayloadState,
}

impl PayloadStateTestContext {
    pub fn new(
        test_name: &'static str,
        config: Config,
    ) -> PayloadStateTestContext {
        let log = test_setup_log(test_name);
        let prefs = Arc::new(FakePrefs::new());
        let powerwash_prefs = Arc::new(FakePrefs::new());
        let clock = Arc::new(FakeClock::new());
        let system = Arc::new(FakeSystemInfo::new());
        let metrics = Arc::new(MetricsRecorder::new());
        let state = PayloadState::load(
            &log,
            config.clone(),
            prefs.clone(),
            powerwash_prefs.clone(),
            clock.clone(),
            system.clone(),
            metrics.clone(),
        );
        PayloadStateTestContext {
            log,
            config,
            prefs,
            powerwash_prefs,
            clock,
            system,
            metrics,
            state,
        }
    }

    /// Reload the machine from the same stores and clocks, as a process
    /// restart would.
    pub fn restart(self) -> PayloadStateTestContext {
        let state = PayloadState::load(
            &self.log,
            self.config.clone(),
            self.prefs.clone(),
            self.powerwash_prefs.clone(),
            self.clock.clone(),
            self.system.clone(),
            self.metrics.clone(),
        );
        PayloadStateTestContext { state, ..self }
    }
}
