// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The structured update offer handed to the state machine, and the
//! signature that decides whether two offers are "the same".

use crate::download_source::DownloadSource;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// One payload URL from an update offer, with the attributes the server
/// attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadUrl {
    pub url: String,

    /// Per-URL failure limit advertised by the server. The client applies
    /// [`crate::Config::max_url_failure_count`] uniformly; the advertised
    /// limit still participates in offer identity.
    pub failure_limit: u32,

    /// Which download source fetching from this URL counts against.
    pub source: DownloadSource,
}

/// An update offer, already parsed by the caller.
///
/// The state machine never fetches anything; it consumes this value
/// through [`crate::PayloadState::set_response`] and steers the caller's
/// download attempts.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Version of the offered update manifest.
    pub version: String,

    /// Size in bytes of the payload.
    pub payload_size: u64,

    /// Lowercase hex SHA-256 of the payload.
    pub payload_hash: String,

    /// Size in bytes of the payload metadata.
    pub metadata_size: u64,

    /// Signature over the payload metadata.
    pub metadata_signature: String,

    /// Payload URLs in the server's preference order.
    pub payload_urls: Vec<PayloadUrl>,

    /// True for a delta payload, false for a full image.
    pub is_delta_payload: bool,

    /// The user asked for this update; backoff never applies.
    pub is_interactive: bool,

    /// The server set an install deadline; backoff does not apply to full
    /// payloads.
    pub has_install_deadline: bool,
}

impl UpdateResponse {
    /// A stable digest over the subset of the offer that affects this
    /// state machine. Two offers with equal signatures are the same offer:
    /// counters persist across them. Anything else supersedes the current
    /// offer and resets the response-scoped state.
    ///
    /// The format is one `key = value` line per field. No field can forge
    /// another line because every line is key-prefixed and the URL count
    /// pins the length of the list.
    pub fn signature(&self) -> String {
        let mut sig = String::new();
        let _ = writeln!(sig, "Version = {}", self.version);
        let _ = writeln!(sig, "NumUrls = {}", self.payload_urls.len());
        for (i, payload_url) in self.payload_urls.iter().enumerate() {
            let _ = writeln!(
                sig,
                "Url{i} = {} (limit = {}, source = {})",
                payload_url.url, payload_url.failure_limit, payload_url.source,
            );
        }
        let _ = writeln!(sig, "Payload Size = {}", self.payload_size);
        let _ = writeln!(sig, "Payload Sha256 Hash = {}", self.payload_hash);
        let _ = writeln!(sig, "Metadata Size = {}", self.metadata_size);
        let _ = write!(
            sig,
            "Metadata Signature = {}",
            self.metadata_signature
        );
        sig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> UpdateResponse {
        UpdateResponse {
            version: "9999.0.0".into(),
            payload_size: 523_456_789,
            payload_hash: "3d5a...".into(),
            metadata_size: 58_123,
            metadata_signature: "ZmFrZQ==".into(),
            payload_urls: vec![
                PayloadUrl {
                    url: "https://updates.example.com/payload".into(),
                    failure_limit: 10,
                    source: DownloadSource::HttpsServer,
                },
                PayloadUrl {
                    url: "http://updates.example.com/payload".into(),
                    failure_limit: 10,
                    source: DownloadSource::HttpServer,
                },
            ],
            is_delta_payload: false,
            is_interactive: false,
            has_install_deadline: false,
        }
    }

    #[test]
    fn signature_is_stable() {
        assert_eq!(response().signature(), response().signature());
    }

    #[test]
    fn signature_covers_behavioral_fields() {
        let base = response().signature();

        let mut r = response();
        r.version = "10000.0.0".into();
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.payload_size += 1;
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.payload_hash = "other".into();
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.metadata_size += 1;
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.metadata_signature = "b3RoZXI=".into();
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.payload_urls[0].failure_limit = 3;
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.payload_urls.reverse();
        assert_ne!(r.signature(), base);

        let mut r = response();
        r.payload_urls.pop();
        assert_ne!(r.signature(), base);
    }

    #[test]
    fn signature_ignores_delivery_hints() {
        // Interactivity and deadlines change backoff behavior for the
        // current offer but do not make it a different offer.
        let base = response().signature();

        let mut r = response();
        r.is_interactive = true;
        assert_eq!(r.signature(), base);

        let mut r = response();
        r.has_install_deadline = true;
        assert_eq!(r.signature(), base);
    }

    #[test]
    fn url_list_cannot_forge_scalar_fields() {
        // A URL whose text mimics a signature line must not collide with a
        // response that genuinely differs.
        let mut with_tricky_url = response();
        with_tricky_url.payload_urls.pop();
        with_tricky_url.payload_urls[0].url =
            "x\nPayload Size = 1".to_string();

        let mut honest = response();
        honest.payload_urls.pop();
        honest.payload_urls[0].url = "x".to_string();
        honest.payload_size = 1;

        assert_ne!(with_tricky_url.signature(), honest.signature());
    }
}
