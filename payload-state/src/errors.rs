// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error codes observed by the state machine and how each one steers the
//! attempt sequencing.
//!
//! The machine does not produce these errors; the download and apply
//! pipeline reports them through [`crate::PayloadState::update_failed`].
//! What matters here is only the classification: does a given code penalize
//! the current URL, skip it, end the attempt, or change nothing.

use serde::{Deserialize, Serialize};

/// Failure codes the download/apply pipeline can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Not an error. Reported by drivers that funnel every completion
    /// through the same path; changes nothing here.
    Success,

    /// Catch-all internal failure with no more specific code.
    Error,

    /// The update server authoritatively rejected the request.
    ServerRejection,

    /// Transient transport failure while fetching payload bytes.
    DownloadTransferError,

    /// Writing fetched bytes to local storage failed.
    DownloadWriteError,

    /// The payload did not match the SHA-256 hash the server advertised.
    PayloadHashMismatch,

    /// The payload was not the size the server advertised.
    PayloadSizeMismatch,

    /// The payload metadata signature did not verify.
    MetadataSignatureMismatch,

    /// A signed delta payload was expected but something else was served.
    SignedDeltaPayloadExpected,

    /// The target partition could not be opened for writing.
    InstallDeviceOpenError,

    /// Local storage ran out of space while applying the payload.
    OutOfSpace,

    /// The attempt was postponed by policy; try again later.
    PostponedPerPolicy,
}

/// What the sequencer does in response to a reported [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Leave every counter alone.
    Ignore,

    /// Count a failure against the current URL; enough consecutive ones
    /// advance to the next URL.
    RetryUrl,

    /// Skip the rest of this URL's retries and advance to the next URL
    /// immediately.
    NextUrl,

    /// Close out the attempt: report its accounting and clear the
    /// per-attempt byte counters, without advancing URL or attempt number.
    Terminal,
}

impl ErrorCode {
    /// The canonical classification table.
    ///
    /// Codes that indicate a problem with the URL itself (bad bytes, bad
    /// metadata, a server that rejected us) skip to the next URL so the
    /// client recovers quickly. Codes that look like transient plumbing
    /// trouble stay on the URL and burn a failure. Local fatal conditions
    /// end the attempt without penalizing any URL.
    pub fn action(self) -> ErrorAction {
        match self {
            ErrorCode::Success | ErrorCode::PostponedPerPolicy => {
                ErrorAction::Ignore
            }

            ErrorCode::ServerRejection
            | ErrorCode::PayloadHashMismatch
            | ErrorCode::PayloadSizeMismatch
            | ErrorCode::MetadataSignatureMismatch
            | ErrorCode::SignedDeltaPayloadExpected => ErrorAction::NextUrl,

            ErrorCode::InstallDeviceOpenError | ErrorCode::OutOfSpace => {
                ErrorAction::Terminal
            }

            // Everything else is assumed transient: keep the URL and retry.
            ErrorCode::Error
            | ErrorCode::DownloadTransferError
            | ErrorCode::DownloadWriteError => ErrorAction::RetryUrl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            (ErrorCode::Success, ErrorAction::Ignore),
            (ErrorCode::PostponedPerPolicy, ErrorAction::Ignore),
            (ErrorCode::Error, ErrorAction::RetryUrl),
            (ErrorCode::DownloadTransferError, ErrorAction::RetryUrl),
            (ErrorCode::DownloadWriteError, ErrorAction::RetryUrl),
            (ErrorCode::ServerRejection, ErrorAction::NextUrl),
            (ErrorCode::PayloadHashMismatch, ErrorAction::NextUrl),
            (ErrorCode::PayloadSizeMismatch, ErrorAction::NextUrl),
            (ErrorCode::MetadataSignatureMismatch, ErrorAction::NextUrl),
            (ErrorCode::SignedDeltaPayloadExpected, ErrorAction::NextUrl),
            (ErrorCode::InstallDeviceOpenError, ErrorAction::Terminal),
            (ErrorCode::OutOfSpace, ErrorAction::Terminal),
        ];
        for (code, action) in cases {
            assert_eq!(code.action(), action, "wrong action for {code:?}");
        }
    }
}
