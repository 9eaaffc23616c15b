//! Captured record types.
//!
//! This module defines the two record kinds that flow from capture sources
//! through the collector to observers. Records are immutable once created and
//! serialize to the camelCase JSON shape used on the wire.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Header name to value map, after redaction.
pub type Headers = BTreeMap<String, String>;

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Severity of a captured log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    /// Returns the lowercase wire name of this severity.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&tracing::Level> for Severity {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => Self::Trace,
            tracing::Level::DEBUG => Self::Debug,
            tracing::Level::INFO => Self::Info,
            tracing::Level::WARN => Self::Warn,
            tracing::Level::ERROR => Self::Error,
        }
    }
}

/// A single captured log message.
///
/// # Example
///
/// ```
/// use server_devtools::types::{LogRecord, Severity};
///
/// let record = LogRecord::new(Severity::Info, "server started", Default::default());
/// assert_eq!(record.level, Severity::Info);
/// assert!(record.stack.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// Unique record identifier.
    pub id: Uuid,

    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,

    /// Severity of the message.
    pub level: Severity,

    /// Rendered message text.
    pub message: String,

    /// Structured arguments the message was emitted with.
    pub args: Map<String, Value>,

    /// Emitting module or logger name, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Captured call stack. Only ever present on error records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Hash of `severity:message`, used by clients to collapse repeats.
    pub hash: String,
}

impl LogRecord {
    /// Creates a record stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(level: Severity, message: impl Into<String>, args: Map<String, Value>) -> Self {
        let message = message.into();
        let hash = message_hash(&format!("{level}:{message}"));
        Self {
            id: Uuid::new_v4(),
            timestamp: now_millis(),
            level,
            message,
            args,
            target: None,
            stack: None,
            hash,
        }
    }

    /// Sets the emitting target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attaches a call stack. Ignored unless the record has error severity.
    #[must_use]
    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        if self.level == Severity::Error {
            self.stack = stack;
        }
        self
    }
}

/// Computes the collapse hash used on log records.
///
/// This is the 32-bit djb2-xor hash (`h = (h * 33) ^ c`, seeded with 5381)
/// over UTF-16 code units, rendered in base 36. Values match the same hash
/// computed over a JavaScript string.
#[must_use]
pub fn message_hash(input: &str) -> String {
    let hash = input
        .encode_utf16()
        .fold(5381u32, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit));
    to_base36(hash)
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(7);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// HTTP method of a captured call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Unknown,
}

impl HttpMethod {
    /// Maps a raw method name onto the fixed method set.
    ///
    /// A missing method is a `GET`. Anything outside the set maps to
    /// [`HttpMethod::Unknown`].
    #[must_use]
    pub fn normalize(method: Option<&str>) -> Self {
        let Some(method) = method else {
            return Self::Get;
        };
        match method.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            _ => Self::Unknown,
        }
    }
}

/// Capture mechanism that produced a network record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSource {
    /// Calls made through [`CapturingClient`](crate::capture::client::CapturingClient).
    Reqwest,
    /// Calls reported by hand through [`NetworkTracker`](crate::capture::network::NetworkTracker).
    Manual,
}

/// Start and end of a call, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub start: i64,
    pub end: i64,
}

/// A completed (or failed) outbound network call.
///
/// Only finished calls become records; in-flight calls live in the
/// producer's own state until they complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    /// Unique record identifier.
    pub id: Uuid,

    /// Call start, milliseconds since the Unix epoch.
    pub timestamp: i64,

    pub method: HttpMethod,

    pub url: String,

    /// Response status. 0 means the call failed before a response arrived.
    pub status: u16,

    pub status_text: String,

    /// Call duration in milliseconds.
    pub duration: u64,

    pub request_headers: Headers,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,

    pub response_headers: Headers,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,

    pub timing: Timing,

    /// Failure description, present only when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub source: NetworkSource,
}

impl NetworkRecord {
    /// Returns `true` if the call failed before receiving a response.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Severity
    // ========================================================================

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Warn).unwrap(), r#""warn""#);
        assert_eq!(
            serde_json::from_str::<Severity>(r#""error""#).unwrap(),
            Severity::Error
        );
    }

    #[test]
    fn severity_from_tracing_level() {
        assert_eq!(Severity::from(&tracing::Level::TRACE), Severity::Trace);
        assert_eq!(Severity::from(&tracing::Level::DEBUG), Severity::Debug);
        assert_eq!(Severity::from(&tracing::Level::INFO), Severity::Info);
        assert_eq!(Severity::from(&tracing::Level::WARN), Severity::Warn);
        assert_eq!(Severity::from(&tracing::Level::ERROR), Severity::Error);
    }

    // ========================================================================
    // LogRecord
    // ========================================================================

    #[test]
    fn log_record_hash_covers_severity_and_message() {
        let info = LogRecord::new(Severity::Info, "hello", Map::new());
        let info_again = LogRecord::new(Severity::Info, "hello", Map::new());
        let warn = LogRecord::new(Severity::Warn, "hello", Map::new());

        assert_eq!(info.hash, info_again.hash);
        assert_ne!(info.hash, warn.hash);
        assert_ne!(info.id, info_again.id);
        assert_eq!(info.hash, message_hash("info:hello"));
    }

    #[test]
    fn stack_only_kept_for_errors() {
        let info = LogRecord::new(Severity::Info, "fine", Map::new())
            .with_stack(Some("frame".to_string()));
        let error = LogRecord::new(Severity::Error, "boom", Map::new())
            .with_stack(Some("frame".to_string()));

        assert!(info.stack.is_none());
        assert_eq!(error.stack.as_deref(), Some("frame"));
    }

    #[test]
    fn log_record_json_shape() {
        let mut args = Map::new();
        args.insert("user".to_string(), Value::from(7));
        let record = LogRecord::new(Severity::Info, "login", args).with_target("app::auth");

        let json: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["level"], "info");
        assert_eq!(json["message"], "login");
        assert_eq!(json["args"]["user"], 7);
        assert_eq!(json["target"], "app::auth");
        assert!(json.get("stack").is_none());
        assert!(json["timestamp"].is_i64());
    }

    // ========================================================================
    // message_hash
    // ========================================================================

    #[test]
    fn message_hash_of_empty_input_is_seed() {
        // 5381 in base 36
        assert_eq!(message_hash(""), "45h");
    }

    #[test]
    fn message_hash_folds_utf16_code_units() {
        // U+1F600 is the surrogate pair D83D DE00.
        assert_eq!(message_hash("\u{1F600}"), "35rq0");
        assert_eq!(message_hash("info:\u{1F600}"), "nq0rvw");
    }

    #[test]
    fn message_hash_is_base36() {
        let hash = message_hash("error:something went wrong");
        assert!(!hash.is_empty());
        assert!(hash
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    // ========================================================================
    // HttpMethod
    // ========================================================================

    #[test]
    fn normalize_known_methods_case_insensitively() {
        assert_eq!(HttpMethod::normalize(Some("get")), HttpMethod::Get);
        assert_eq!(HttpMethod::normalize(Some("Post")), HttpMethod::Post);
        assert_eq!(HttpMethod::normalize(Some("OPTIONS")), HttpMethod::Options);
    }

    #[test]
    fn normalize_missing_method_is_get() {
        assert_eq!(HttpMethod::normalize(None), HttpMethod::Get);
    }

    #[test]
    fn normalize_unrecognized_method_is_unknown() {
        assert_eq!(HttpMethod::normalize(Some("PROPFIND")), HttpMethod::Unknown);
        assert_eq!(HttpMethod::normalize(Some("")), HttpMethod::Unknown);
        assert_eq!(
            serde_json::to_string(&HttpMethod::Unknown).unwrap(),
            r#""UNKNOWN""#
        );
    }

    // ========================================================================
    // NetworkRecord
    // ========================================================================

    #[test]
    fn network_record_json_shape() {
        let mut request_headers = Headers::new();
        request_headers.insert("accept".to_string(), "application/json".to_string());

        let record = NetworkRecord {
            id: Uuid::new_v4(),
            timestamp: 1_000,
            method: HttpMethod::Post,
            url: "https://api.example.com/items".to_string(),
            status: 201,
            status_text: "Created".to_string(),
            duration: 12,
            request_headers,
            request_body: Some("{}".to_string()),
            response_headers: Headers::new(),
            response_body: None,
            timing: Timing {
                start: 1_000,
                end: 1_012,
            },
            error: None,
            source: NetworkSource::Reqwest,
        };

        let json: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["statusText"], "Created");
        assert_eq!(json["requestHeaders"]["accept"], "application/json");
        assert_eq!(json["requestBody"], "{}");
        assert!(json.get("responseBody").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["timing"]["end"], 1_012);
        assert_eq!(json["source"], "reqwest");
        assert!(!record.is_failure());
    }
}
