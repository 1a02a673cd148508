// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted state machine driving OS update payload downloads.
//!
//! An auto-update client is mostly plumbing around one hard problem:
//! remembering where it is. The process restarts, the device reboots
//! (cleanly or not), the server changes its mind about what to offer, a
//! factory reset wipes most of the disk, and through all of it the client
//! has to keep making forward progress without re-downloading what it
//! already has or hammering a URL that keeps failing.
//!
//! This crate is that memory. [`PayloadState`] consumes structured events
//! from a driver (a new offer, download progress, a failure, a success, a
//! reboot) and answers the questions the driver has to ask: which URL do I
//! fetch from next, am I allowed to download right now, which version did
//! the user roll back from. Everything it tracks is written through to a
//! pair of injected key-value stores, one ordinary and one that survives
//! factory reset.
//!
//! The crate does no I/O of its own beyond those stores: byte transfer,
//! response parsing, policy evaluation, clocks, and metrics transport are
//! all consumed through narrow traits ([`PersistedStore`], [`Clock`],
//! [`SystemInfo`], [`metrics::MetricsSink`]).

mod backoff;
mod config;
mod download_source;
mod errors;
pub mod prefs;
mod response;
mod state;
mod system;

pub mod metrics;

pub use config::Config;
pub use download_source::DownloadSource;
pub use errors::{ErrorAction, ErrorCode};
pub use prefs::{PersistedStore, PrefsError};
pub use response::{PayloadUrl, UpdateResponse};
pub use state::PayloadState;
pub use system::{Clock, SystemClock, SystemInfo};
