//! In-flight network call tracking.
//!
//! [`NetworkTracker`] is the producer interface for outbound calls. A call is
//! opened with [`start`](NetworkTracker::start), may stream request body
//! chunks, and is closed by exactly one of [`finish`](NetworkTracker::finish)
//! or [`fail`](NetworkTracker::fail). Only closing a call produces a
//! [`NetworkRecord`]; open calls live in the tracker's own table and are
//! never visible to observers.
//!
//! The capture policy is read once when the call starts and applies to the
//! whole call, so a policy change mid-call cannot produce a half-redacted
//! record.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use server_devtools::broadcast::Notifier;
//! use server_devtools::capture::network::{NetworkTracker, ResponseBody, ResponseInfo};
//! use server_devtools::collector::EventCollector;
//! use server_devtools::policy::{CapturePolicy, PolicySnapshot};
//! use server_devtools::types::{Headers, NetworkSource};
//!
//! let collector = Arc::new(EventCollector::new(100, 100, Notifier::new()));
//! let policy = Arc::new(CapturePolicy::new(PolicySnapshot::default(), 1000));
//! let tracker = NetworkTracker::new(Arc::clone(&collector), policy);
//!
//! let id = tracker.start(NetworkSource::Manual, Some("post"), "https://api.example.com/items", Headers::new());
//! tracker.append_request_body(id, br#"{"name":"widget"}"#).unwrap();
//! assert!(collector.get_requests().is_empty());
//!
//! tracker
//!     .finish(id, ResponseInfo::new(201, "Created").with_body(ResponseBody::Bytes(b"ok".to_vec())))
//!     .unwrap();
//!
//! let record = &collector.get_requests()[0];
//! assert_eq!(record.status, 201);
//! assert_eq!(record.request_body.as_deref(), Some(r#"{"name":"widget"}"#));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::EventCollector;
use crate::error::CaptureError;
use crate::policy::{body_text, redact, CapturePolicy, PolicySnapshot};
use crate::types::{now_millis, Headers, HttpMethod, NetworkRecord, NetworkSource, Timing};

/// Body text recorded when a response body could not be read.
pub const UNREADABLE_BODY: &str = "[Unable to read response body]";

/// Status text recorded for calls that failed before a response arrived.
pub const FAILED_STATUS_TEXT: &str = "Failed";

/// Bytes kept past the truncation limit while streaming a body in, so the
/// final text is still known to exceed the limit.
pub(crate) const BODY_SLACK_BYTES: usize = 4;

/// Handle for a call opened with [`NetworkTracker::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(u64);

impl CallId {
    /// Wraps a raw id.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the response body of a finished call should be recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ResponseBody {
    /// The producer did not read the body.
    #[default]
    NotCaptured,
    /// The full body bytes.
    Bytes(Vec<u8>),
    /// Reading the body failed.
    Unreadable,
}

/// Response details reported when a call finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub status_text: String,
    /// Raw headers. Redaction is applied by the tracker.
    pub headers: Headers,
    pub body: ResponseBody,
    /// Time from call start until the response arrived. Measured by the
    /// tracker when the call closes if not given.
    pub duration: Option<Duration>,
}

impl ResponseInfo {
    #[must_use]
    pub fn new(status: u16, status_text: impl Into<String>) -> Self {
        Self {
            status,
            status_text: status_text.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

#[derive(Debug)]
struct InFlight {
    source: NetworkSource,
    method: HttpMethod,
    url: String,
    request_headers: Headers,
    request_body: Option<Vec<u8>>,
    policy: PolicySnapshot,
    started_at: i64,
    started: Instant,
}

impl InFlight {
    fn close(
        self,
        elapsed: Option<Duration>,
        status: u16,
        status_text: String,
        response_headers: Headers,
        response_body: Option<String>,
        error: Option<String>,
    ) -> NetworkRecord {
        let elapsed = elapsed.unwrap_or_else(|| self.started.elapsed());
        let duration = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let end = self
            .started_at
            .saturating_add(i64::try_from(duration).unwrap_or(i64::MAX));
        let limit = self.policy.truncate_body_bytes;

        NetworkRecord {
            id: Uuid::new_v4(),
            timestamp: self.started_at,
            method: self.method,
            url: self.url,
            status,
            status_text,
            duration,
            request_headers: self.request_headers,
            request_body: self.request_body.map(|bytes| body_text(&bytes, limit)),
            response_headers,
            response_body,
            timing: Timing {
                start: self.started_at,
                end,
            },
            error,
            source: self.source,
        }
    }
}

/// Tracks started-but-unfinished calls and records them when they close.
#[derive(Debug)]
pub struct NetworkTracker {
    collector: Arc<EventCollector>,
    policy: Arc<CapturePolicy>,
    in_flight: Mutex<HashMap<CallId, InFlight>>,
    next_id: AtomicU64,
}

impl NetworkTracker {
    #[must_use]
    pub fn new(collector: Arc<EventCollector>, policy: Arc<CapturePolicy>) -> Self {
        Self {
            collector,
            policy,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<CallId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a call.
    ///
    /// `headers` are redacted immediately with the current policy. A missing
    /// `method` is recorded as `GET`.
    pub fn start(
        &self,
        source: NetworkSource,
        method: Option<&str>,
        url: impl Into<String>,
        headers: Headers,
    ) -> CallId {
        let policy = self.policy.snapshot();
        let id = CallId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let call = InFlight {
            source,
            method: HttpMethod::normalize(method),
            url: url.into(),
            request_headers: redact(headers, &policy.redact_headers),
            request_body: None,
            policy,
            started_at: now_millis(),
            started: Instant::now(),
        };
        self.table().insert(id, call);
        id
    }

    /// Appends a chunk of request body.
    ///
    /// Ignored when request bodies were not being captured at call start.
    /// Bytes far past the truncation limit are discarded as they arrive. A
    /// call that never receives a chunk is recorded without a request body.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::UnknownCall`] if `id` is not in flight.
    pub fn append_request_body(&self, id: CallId, chunk: &[u8]) -> Result<(), CaptureError> {
        let mut table = self.table();
        let call = table.get_mut(&id).ok_or(CaptureError::UnknownCall(id))?;
        if !call.policy.capture_request_bodies {
            return Ok(());
        }
        let keep = call.policy.truncate_body_bytes.saturating_add(BODY_SLACK_BYTES);
        let body = call.request_body.get_or_insert_with(Vec::new);
        let room = keep.saturating_sub(body.len());
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        Ok(())
    }

    /// Returns how many response body bytes a producer should buffer for
    /// this call, or `None` if response bodies were not being captured when
    /// the call started.
    #[must_use]
    pub fn response_body_budget(&self, id: CallId) -> Option<usize> {
        self.table().get(&id).and_then(|call| {
            call.policy
                .capture_response_bodies
                .then(|| call.policy.truncate_body_bytes.saturating_add(BODY_SLACK_BYTES))
        })
    }

    /// Closes a call that received a response and records it.
    ///
    /// Returns `true` if the record was stored (the network channel was not
    /// paused).
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::UnknownCall`] if `id` is not in flight.
    pub fn finish(&self, id: CallId, response: ResponseInfo) -> Result<bool, CaptureError> {
        let call = self.take(id)?;
        let policy = &call.policy;

        let response_body = if policy.capture_response_bodies {
            match response.body {
                ResponseBody::NotCaptured => None,
                ResponseBody::Bytes(bytes) => Some(body_text(&bytes, policy.truncate_body_bytes)),
                ResponseBody::Unreadable => Some(UNREADABLE_BODY.to_string()),
            }
        } else {
            None
        };
        let response_headers = redact(response.headers, &policy.redact_headers);

        let record = call.close(
            response.duration,
            response.status,
            response.status_text,
            response_headers,
            response_body,
            None,
        );
        Ok(self.collector.add_network(record))
    }

    /// Closes a call that failed before receiving a response and records it
    /// with status 0.
    ///
    /// `duration` is measured by the tracker when not given.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::UnknownCall`] if `id` is not in flight.
    pub fn fail(
        &self,
        id: CallId,
        error: impl fmt::Display,
        duration: Option<Duration>,
    ) -> Result<bool, CaptureError> {
        let call = self.take(id)?;
        let record = call.close(
            duration,
            0,
            FAILED_STATUS_TEXT.to_string(),
            Headers::new(),
            None,
            Some(error.to_string()),
        );
        Ok(self.collector.add_network(record))
    }

    /// Drops a call without recording it.
    pub fn abandon(&self, id: CallId) {
        self.table().remove(&id);
    }

    /// Number of calls currently open.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    fn take(&self, id: CallId) -> Result<InFlight, CaptureError> {
        self.table().remove(&id).ok_or(CaptureError::UnknownCall(id))
    }
}
