//! Runtime capture policy.
//!
//! [`CapturePolicy`] is the single shared, remotely mutable configuration that
//! capture sources consult on every call: how many body bytes to keep, whether
//! to keep request and response bodies at all, and which headers to redact.
//! Observers change it through `control` messages; producers read it through
//! [`CapturePolicy::snapshot`].
//!
//! The free functions [`truncate`] and [`redact`] are the helpers producers
//! apply to body text and header maps.
//!
//! # Example
//!
//! ```rust
//! use server_devtools::policy::{truncate, CapturePolicy, PolicyPatch, PolicySnapshot};
//!
//! let policy = CapturePolicy::new(PolicySnapshot::default(), 10);
//! policy.apply_patch(&PolicyPatch {
//!     truncate_body_bytes: Some(16.0),
//!     ..Default::default()
//! });
//!
//! let limit = policy.snapshot().truncate_body_bytes;
//! assert_eq!(truncate("a fairly long response body", limit), "a fairly long re... [truncated]");
//! ```

use std::borrow::Cow;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Headers;

/// Marker appended to truncated text.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Value substituted for redacted header values.
pub const REDACTED: &str = "[REDACTED]";

/// Default body truncation limit in bytes.
pub const DEFAULT_TRUNCATE_BODY_BYTES: usize = 1_000_000;

/// Default lower bound for the truncation limit.
pub const DEFAULT_MIN_TRUNCATE_BODY_BYTES: usize = 1_000;

/// Header names redacted unless configured otherwise.
pub const DEFAULT_REDACT_HEADERS: [&str; 3] = ["authorization", "cookie", "set-cookie"];

/// A point-in-time copy of the capture policy.
///
/// This is also the payload of the `config` protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    /// Maximum number of body bytes kept before truncation.
    pub truncate_body_bytes: usize,

    pub capture_request_bodies: bool,

    pub capture_response_bodies: bool,

    /// Lower-cased, trimmed header names whose values are redacted.
    pub redact_headers: Vec<String>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            truncate_body_bytes: DEFAULT_TRUNCATE_BODY_BYTES,
            capture_request_bodies: true,
            capture_response_bodies: true,
            redact_headers: DEFAULT_REDACT_HEADERS
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
        }
    }
}

/// A partial policy update.
///
/// Absent fields leave the current value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyPatch {
    /// New truncation limit. Ignored unless finite and positive.
    pub truncate_body_bytes: Option<f64>,
    pub capture_request_bodies: Option<bool>,
    pub capture_response_bodies: Option<bool>,
    /// Replacement redact list. Replaces the whole list after normalization.
    pub redact_headers: Option<Vec<String>>,
}

impl PolicyPatch {
    /// Returns `true` if the patch carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.truncate_body_bytes.is_none()
            && self.capture_request_bodies.is_none()
            && self.capture_response_bodies.is_none()
            && self.redact_headers.is_none()
    }
}

/// Shared, mutable capture policy.
///
/// Reads always observe the most recently applied patch. Concurrent patches
/// are last-writer-wins per field.
#[derive(Debug)]
pub struct CapturePolicy {
    current: RwLock<PolicySnapshot>,
    min_truncate_body_bytes: usize,
}

impl CapturePolicy {
    /// Creates a policy from initial values.
    ///
    /// The initial values go through the same normalization as patches: the
    /// truncation limit is raised to `min_truncate_body_bytes` and the redact
    /// list is trimmed, lower-cased and deduplicated.
    #[must_use]
    pub fn new(initial: PolicySnapshot, min_truncate_body_bytes: usize) -> Self {
        let min_truncate_body_bytes = min_truncate_body_bytes.max(1);
        let current = PolicySnapshot {
            truncate_body_bytes: initial.truncate_body_bytes.max(min_truncate_body_bytes),
            redact_headers: normalize_header_names(&initial.redact_headers),
            ..initial
        };
        Self {
            current: RwLock::new(current),
            min_truncate_body_bytes,
        }
    }

    /// Returns a copy of the current policy.
    #[must_use]
    pub fn snapshot(&self) -> PolicySnapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the lowest truncation limit the policy accepts.
    #[must_use]
    pub fn min_truncate_body_bytes(&self) -> usize {
        self.min_truncate_body_bytes
    }

    /// Applies a partial update and returns the resulting policy.
    ///
    /// A non-finite or non-positive truncation limit is ignored and the prior
    /// value retained. Valid limits are floored to a whole number of bytes
    /// and raised to the configured minimum.
    pub fn apply_patch(&self, patch: &PolicyPatch) -> PolicySnapshot {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(limit) = patch.truncate_body_bytes {
            if limit.is_finite() && limit > 0.0 {
                // Saturating float-to-int cast; huge values clamp to usize::MAX.
                let bytes = limit.floor() as usize;
                current.truncate_body_bytes = bytes.max(self.min_truncate_body_bytes);
            } else {
                debug!(limit, "Ignoring invalid truncation limit");
            }
        }
        if let Some(enabled) = patch.capture_request_bodies {
            current.capture_request_bodies = enabled;
        }
        if let Some(enabled) = patch.capture_response_bodies {
            current.capture_response_bodies = enabled;
        }
        if let Some(names) = &patch.redact_headers {
            current.redact_headers = normalize_header_names(names);
        }

        current.clone()
    }
}

/// Trims, lower-cases and deduplicates header names, dropping blank entries.
///
/// The first occurrence of each name keeps its position.
#[must_use]
pub fn normalize_header_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref().trim().to_ascii_lowercase();
        if !name.is_empty() && !normalized.contains(&name) {
            normalized.push(name);
        }
    }
    normalized
}

/// Truncates `text` to at most `limit` bytes.
///
/// Text within the limit is returned unchanged. Longer text is cut at the
/// last character boundary at or below `limit` and [`TRUNCATION_MARKER`] is
/// appended.
#[must_use]
pub fn truncate(text: &str, limit: usize) -> Cow<'_, str> {
    if text.len() <= limit {
        return Cow::Borrowed(text);
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + TRUNCATION_MARKER.len());
    out.push_str(&text[..end]);
    out.push_str(TRUNCATION_MARKER);
    Cow::Owned(out)
}

/// Decodes a body as UTF-8 (lossily) and truncates it to `limit` bytes.
#[must_use]
pub fn body_text(bytes: &[u8], limit: usize) -> String {
    truncate(&String::from_utf8_lossy(bytes), limit).into_owned()
}

/// Replaces the value of every blocked header with [`REDACTED`].
///
/// Header names and `blocked` entries are both matched case-insensitively.
/// With an empty block list the map is returned as is.
#[must_use]
pub fn redact<S: AsRef<str>>(mut headers: Headers, blocked: &[S]) -> Headers {
    if blocked.is_empty() {
        return headers;
    }
    for (name, value) in headers.iter_mut() {
        if blocked
            .iter()
            .any(|blocked| blocked.as_ref().trim().eq_ignore_ascii_case(name))
        {
            *value = REDACTED.to_string();
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    // ========================================================================
    // truncate
    // ========================================================================

    #[test]
    fn truncate_leaves_short_text_unchanged() {
        assert!(matches!(truncate("hello", 5), Cow::Borrowed("hello")));
        assert_eq!(truncate("", 0), "");
    }

    #[test]
    fn truncate_cuts_and_marks_long_text() {
        let out = truncate("abcdefghij", 4);
        assert_eq!(out, format!("abcd{TRUNCATION_MARKER}"));
    }

    #[test]
    fn truncate_never_keeps_more_than_limit_bytes() {
        let text = "x".repeat(200);
        for limit in [1, 7, 50, 199] {
            let out = truncate(&text, limit);
            let kept = out.strip_suffix(TRUNCATION_MARKER).unwrap();
            assert_eq!(kept.len(), limit);
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // Each 'é' is two bytes; a limit of 3 must not split the second one.
        let out = truncate("ééé", 3);
        assert_eq!(out, format!("é{TRUNCATION_MARKER}"));
    }

    #[test]
    fn body_text_decodes_lossily() {
        let out = body_text(&[0x66, 0x6f, 0xff, 0x6f], 100);
        assert_eq!(out, "fo\u{fffd}o");
    }

    // ========================================================================
    // redact
    // ========================================================================

    #[test]
    fn redact_is_case_insensitive() {
        let input = headers(&[
            ("Authorization", "Bearer secret"),
            ("Content-Type", "application/json"),
        ]);
        let out = redact(input, &["authorization".to_string()]);

        assert_eq!(out["Authorization"], REDACTED);
        assert_eq!(out["Content-Type"], "application/json");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn redact_matches_mixed_case_block_entries() {
        let input = headers(&[("authorization", "secret"), ("X-API-KEY", "k"), ("accept", "*/*")]);
        let out = redact(input, &["Authorization", "x-Api-Key"]);

        assert_eq!(out["authorization"], REDACTED);
        assert_eq!(out["X-API-KEY"], REDACTED);
        assert_eq!(out["accept"], "*/*");
    }

    #[test]
    fn redact_with_empty_block_list_passes_through() {
        let input = headers(&[("Cookie", "session=1")]);
        let out = redact::<String>(input.clone(), &[]);
        assert_eq!(out, input);
    }

    // ========================================================================
    // CapturePolicy
    // ========================================================================

    #[test]
    fn defaults_match_documented_values() {
        let policy = CapturePolicy::new(PolicySnapshot::default(), DEFAULT_MIN_TRUNCATE_BODY_BYTES);
        let snapshot = policy.snapshot();

        assert_eq!(snapshot.truncate_body_bytes, 1_000_000);
        assert!(snapshot.capture_request_bodies);
        assert!(snapshot.capture_response_bodies);
        assert_eq!(
            snapshot.redact_headers,
            vec!["authorization", "cookie", "set-cookie"]
        );
    }

    #[test]
    fn initial_values_are_normalized() {
        let policy = CapturePolicy::new(
            PolicySnapshot {
                truncate_body_bytes: 5,
                redact_headers: vec![" X-Api-Key ".to_string(), String::new()],
                ..PolicySnapshot::default()
            },
            100,
        );
        let snapshot = policy.snapshot();

        assert_eq!(snapshot.truncate_body_bytes, 100);
        assert_eq!(snapshot.redact_headers, vec!["x-api-key"]);
    }

    #[test]
    fn patch_truncation_is_floored_to_minimum() {
        let policy = CapturePolicy::new(PolicySnapshot::default(), 1_000);

        let after = policy.apply_patch(&PolicyPatch {
            truncate_body_bytes: Some(50.0),
            ..Default::default()
        });
        assert_eq!(after.truncate_body_bytes, 1_000);

        let after = policy.apply_patch(&PolicyPatch {
            truncate_body_bytes: Some(2_500.9),
            ..Default::default()
        });
        assert_eq!(after.truncate_body_bytes, 2_500);
    }

    #[test]
    fn patch_with_invalid_truncation_keeps_prior_value() {
        let policy = CapturePolicy::new(PolicySnapshot::default(), 10);
        policy.apply_patch(&PolicyPatch {
            truncate_body_bytes: Some(4_096.0),
            ..Default::default()
        });

        for bad in [f64::NAN, f64::INFINITY, -1.0, 0.0] {
            let after = policy.apply_patch(&PolicyPatch {
                truncate_body_bytes: Some(bad),
                ..Default::default()
            });
            assert_eq!(after.truncate_body_bytes, 4_096, "value {bad}");
        }
    }

    #[test]
    fn patch_replaces_redact_list() {
        let policy = CapturePolicy::new(PolicySnapshot::default(), 10);
        let after = policy.apply_patch(&PolicyPatch {
            redact_headers: Some(vec![
                "  X-Token".to_string(),
                "   ".to_string(),
                "x-token".to_string(),
                "COOKIE".to_string(),
            ]),
            ..Default::default()
        });

        assert_eq!(after.redact_headers, vec!["x-token", "cookie"]);
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let policy = CapturePolicy::new(PolicySnapshot::default(), 10);
        let before = policy.snapshot();

        let after = policy.apply_patch(&PolicyPatch {
            capture_response_bodies: Some(false),
            ..Default::default()
        });

        assert!(!after.capture_response_bodies);
        assert_eq!(after.capture_request_bodies, before.capture_request_bodies);
        assert_eq!(after.truncate_body_bytes, before.truncate_body_bytes);
        assert_eq!(after.redact_headers, before.redact_headers);
        assert_eq!(policy.snapshot(), after);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(PolicySnapshot::default()).unwrap();
        assert_eq!(json["truncateBodyBytes"], 1_000_000);
        assert_eq!(json["captureRequestBodies"], true);
        assert_eq!(json["captureResponseBodies"], true);
        assert_eq!(json["redactHeaders"][0], "authorization");
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(PolicyPatch::default().is_empty());
        assert!(!PolicyPatch {
            capture_request_bodies: Some(true),
            ..Default::default()
        }
        .is_empty());
    }
}
