// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed access to the two persisted key-value stores.
//!
//! The state machine writes every mutation through to persistence and keeps
//! the authoritative value in memory, so a store that fails to read or
//! write degrades durability but never progress. That policy lives in
//! [`Prefs`]: reads that fail or return garbage become "absent" and writes
//! that fail are logged and dropped.

use crate::download_source::DownloadSource;
use slog::{Logger, warn};
use std::sync::Arc;

/// Canonical persisted key names. These are stable across client versions;
/// renaming one orphans the state of every device in the field.
pub mod keys {
    pub const RESPONSE_SIGNATURE: &str = "response-signature";
    pub const PAYLOAD_ATTEMPT_NUMBER: &str = "payload-attempt-number";
    pub const FULL_PAYLOAD_ATTEMPT_NUMBER: &str =
        "full-payload-attempt-number";
    pub const CURRENT_URL_INDEX: &str = "current-url-index";
    pub const CURRENT_URL_FAILURE_COUNT: &str = "current-url-failure-count";
    pub const URL_SWITCH_COUNT: &str = "url-switch-count";
    /// i64 microseconds since the Unix epoch.
    pub const BACKOFF_EXPIRY_TIME: &str = "backoff-expiry-time";
    /// i64 microseconds since the Unix epoch.
    pub const UPDATE_TIMESTAMP_START: &str = "update-timestamp-start";
    /// i64 microseconds of accumulated uptime.
    pub const UPDATE_DURATION_UPTIME: &str = "update-duration-uptime";
    /// Prefix; the full key carries a [`crate::DownloadSource::name`]
    /// suffix.
    pub const CURRENT_BYTES_DOWNLOADED_PREFIX: &str =
        "current-bytes-downloaded-";
    /// Prefix; the full key carries a [`crate::DownloadSource::name`]
    /// suffix.
    pub const TOTAL_BYTES_DOWNLOADED_PREFIX: &str =
        "total-bytes-downloaded-";
    pub const NUM_RESPONSES_SEEN: &str = "num-responses-seen";
    pub const NUM_REBOOTS: &str = "num-reboots";
    pub const PREVIOUS_BOOT_ID: &str = "previous-boot-id";
    pub const TARGET_VERSION_UID: &str = "target-version-uid";
    pub const TARGET_VERSION_ATTEMPTS: &str = "target-version-attempts";
    /// i64 microseconds since the Unix epoch.
    pub const SYSTEM_UPDATED_MARKER: &str = "system-updated-marker";
    /// Lives in the powerwash-safe store.
    pub const ROLLBACK_VERSION: &str = "rollback-version";
}

/// Full key for one of the per-source byte counters.
pub fn source_key(prefix: &str, source: DownloadSource) -> String {
    format!("{prefix}{}", source.name())
}

/// Errors a [`PersistedStore`] implementation can report.
///
/// The state machine logs these and keeps going; see the module docs.
#[derive(Debug, thiserror::Error)]
pub enum PrefsError {
    #[error("I/O error accessing key {key:?}")]
    Io {
        key: String,
        #[source]
        err: std::io::Error,
    },

    #[error("value stored for key {key:?} has the wrong type")]
    WrongType { key: String },
}

/// A persisted string/integer/boolean key-value store.
///
/// Two instances are injected: the ordinary preference store, and a
/// powerwash-safe variant whose contents survive a factory reset. Both are
/// expected to be synchronous and write-through; durability is the
/// implementation's concern, not the state machine's.
pub trait PersistedStore: Send + Sync {
    fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError>;
    fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError>;
    fn get_string(&self, key: &str) -> Result<Option<String>, PrefsError>;
    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError>;
    fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError>;
    fn exists(&self, key: &str) -> Result<bool, PrefsError>;
    fn delete(&self, key: &str) -> Result<(), PrefsError>;
}

/// The state machine's view over the two stores.
#[derive(Clone)]
pub(crate) struct Prefs {
    log: Logger,
    normal: Arc<dyn PersistedStore>,
    powerwash_safe: Arc<dyn PersistedStore>,
}

impl Prefs {
    pub fn new(
        log: Logger,
        normal: Arc<dyn PersistedStore>,
        powerwash_safe: Arc<dyn PersistedStore>,
    ) -> Prefs {
        Prefs { log, normal, powerwash_safe }
    }

    fn store(&self, across_powerwash: bool) -> &dyn PersistedStore {
        if across_powerwash { &*self.powerwash_safe } else { &*self.normal }
    }

    /// Read a non-negative integer. Absent keys, unreadable keys, and
    /// negative values (someone scribbled on the store) all come back as
    /// `None` so the caller falls back to its default.
    pub fn read_count(&self, key: &str, across_powerwash: bool) -> Option<i64> {
        match self.store(across_powerwash).get_i64(key) {
            Ok(Some(value)) if value >= 0 => Some(value),
            Ok(Some(value)) => {
                warn!(
                    self.log, "ignoring negative persisted value";
                    "key" => key,
                    "value" => value,
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                warn!(
                    self.log, "failed to read persisted value";
                    "key" => key,
                    "err" => %err,
                );
                None
            }
        }
    }

    pub fn write_count(&self, key: &str, value: i64, across_powerwash: bool) {
        if let Err(err) = self.store(across_powerwash).set_i64(key, value) {
            warn!(
                self.log, "failed to persist value";
                "key" => key,
                "value" => value,
                "err" => %err,
            );
        }
    }

    pub fn read_string(
        &self,
        key: &str,
        across_powerwash: bool,
    ) -> Option<String> {
        match self.store(across_powerwash).get_string(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    self.log, "failed to read persisted value";
                    "key" => key,
                    "err" => %err,
                );
                None
            }
        }
    }

    pub fn write_string(
        &self,
        key: &str,
        value: &str,
        across_powerwash: bool,
    ) {
        if let Err(err) = self.store(across_powerwash).set_string(key, value) {
            warn!(
                self.log, "failed to persist value";
                "key" => key,
                "err" => %err,
            );
        }
    }

    pub fn exists(&self, key: &str, across_powerwash: bool) -> bool {
        match self.store(across_powerwash).exists(key) {
            Ok(exists) => exists,
            Err(err) => {
                warn!(
                    self.log, "failed to check persisted key";
                    "key" => key,
                    "err" => %err,
                );
                false
            }
        }
    }

    pub fn delete(&self, key: &str, across_powerwash: bool) {
        if let Err(err) = self.store(across_powerwash).delete(key) {
            warn!(
                self.log, "failed to delete persisted key";
                "key" => key,
                "err" => %err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::o;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Value {
        Int(i64),
        String(String),
        Bool(bool),
    }

    /// Minimal in-memory store for exercising the adapter. The richer
    /// fake lives in the test-utils crate; this one exists because unit
    /// tests of a crate cannot share trait impls with the copy of the
    /// crate that test-utils links against.
    #[derive(Default)]
    struct MemStore {
        values: Mutex<BTreeMap<String, Value>>,
        fail_writes: AtomicBool,
    }

    impl MemStore {
        fn write(&self, key: &str, value: Value) -> Result<(), PrefsError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(PrefsError::Io {
                    key: key.to_string(),
                    err: std::io::Error::other("injected failure"),
                });
            }
            self.values.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
    }

    impl PersistedStore for MemStore {
        fn get_i64(&self, key: &str) -> Result<Option<i64>, PrefsError> {
            match self.values.lock().unwrap().get(key) {
                None => Ok(None),
                Some(Value::Int(value)) => Ok(Some(*value)),
                Some(_) => {
                    Err(PrefsError::WrongType { key: key.to_string() })
                }
            }
        }

        fn set_i64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
            self.write(key, Value::Int(value))
        }

        fn get_string(
            &self,
            key: &str,
        ) -> Result<Option<String>, PrefsError> {
            match self.values.lock().unwrap().get(key) {
                None => Ok(None),
                Some(Value::String(value)) => Ok(Some(value.clone())),
                Some(_) => {
                    Err(PrefsError::WrongType { key: key.to_string() })
                }
            }
        }

        fn set_string(
            &self,
            key: &str,
            value: &str,
        ) -> Result<(), PrefsError> {
            self.write(key, Value::String(value.to_string()))
        }

        fn get_bool(&self, key: &str) -> Result<Option<bool>, PrefsError> {
            match self.values.lock().unwrap().get(key) {
                None => Ok(None),
                Some(Value::Bool(value)) => Ok(Some(*value)),
                Some(_) => {
                    Err(PrefsError::WrongType { key: key.to_string() })
                }
            }
        }

        fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
            self.write(key, Value::Bool(value))
        }

        fn exists(&self, key: &str) -> Result<bool, PrefsError> {
            Ok(self.values.lock().unwrap().contains_key(key))
        }

        fn delete(&self, key: &str) -> Result<(), PrefsError> {
            self.values.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn view() -> (Prefs, Arc<MemStore>, Arc<MemStore>) {
        let log = Logger::root(slog::Discard, o!());
        let normal = Arc::new(MemStore::default());
        let powerwash = Arc::new(MemStore::default());
        let prefs = Prefs::new(log, normal.clone(), powerwash.clone());
        (prefs, normal, powerwash)
    }

    #[test]
    fn counts_validate_non_negative() {
        let (prefs, normal, _) = view();

        assert_eq!(prefs.read_count("absent", false), None);

        normal.set_i64("negative", -4).unwrap();
        assert_eq!(prefs.read_count("negative", false), None);

        normal.set_i64("zero", 0).unwrap();
        assert_eq!(prefs.read_count("zero", false), Some(0));

        prefs.write_count("written", 17, false);
        assert_eq!(prefs.read_count("written", false), Some(17));
    }

    #[test]
    fn wrong_type_reads_become_absent() {
        let (prefs, normal, _) = view();

        normal.set_string("key", "not a number").unwrap();
        assert_eq!(prefs.read_count("key", false), None);
    }

    #[test]
    fn write_failures_are_swallowed() {
        let (prefs, normal, _) = view();

        normal.fail_writes.store(true, Ordering::Relaxed);
        prefs.write_count("key", 5, false);
        prefs.write_string("other", "value", false);
        normal.fail_writes.store(false, Ordering::Relaxed);

        assert_eq!(prefs.read_count("key", false), None);
        assert_eq!(prefs.read_string("other", false), None);
    }

    #[test]
    fn stores_are_distinct() {
        let (prefs, normal, powerwash) = view();

        prefs.write_string(keys::ROLLBACK_VERSION, "1.2.3", true);
        assert!(powerwash.exists(keys::ROLLBACK_VERSION).unwrap());
        assert!(!normal.exists(keys::ROLLBACK_VERSION).unwrap());
        assert_eq!(
            prefs.read_string(keys::ROLLBACK_VERSION, true).as_deref(),
            Some("1.2.3")
        );
        assert_eq!(prefs.read_string(keys::ROLLBACK_VERSION, false), None);

        prefs.delete(keys::ROLLBACK_VERSION, true);
        assert!(!prefs.exists(keys::ROLLBACK_VERSION, true));
    }

    #[test]
    fn source_keys_carry_the_source_name() {
        use crate::download_source::DownloadSource;
        assert_eq!(
            source_key(
                keys::CURRENT_BYTES_DOWNLOADED_PREFIX,
                DownloadSource::HttpsServer
            ),
            "current-bytes-downloaded-HttpsServer"
        );
        assert_eq!(
            source_key(
                keys::TOTAL_BYTES_DOWNLOADED_PREFIX,
                DownloadSource::HttpPeer
            ),
            "total-bytes-downloaded-HttpPeer"
        );
    }
}
