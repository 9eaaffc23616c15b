//! Observer wire protocol.
//!
//! Every message is a JSON text frame tagged by a `type` field.
//!
//! Server to observer ([`ServerMessage`]):
//!
//! | `type` | Payload |
//! |--------|---------|
//! | `batch` | `data: {logs, requests}`, full history, first message on connect |
//! | `status` | `data: {pausedLogs, pausedNetwork}` |
//! | `config` | `data: {truncateBodyBytes, captureRequestBodies, captureResponseBodies, redactHeaders}` |
//! | `log` | `data: LogRecord` |
//! | `network` | `data: NetworkRecord` |
//! | `clear` | `target: "logs" \| "network" \| "all"` |
//!
//! Observer to server ([`ClientMessage`]):
//!
//! | `type` | Payload |
//! |--------|---------|
//! | `clear` | `target: "logs" \| "network" \| "all"` |
//! | `control` | `data: {pauseLogs?, pauseNetwork?, truncateBodyBytes?, captureRequestBodies?, captureResponseBodies?, redactHeaders?}` |
//!
//! Inbound messages that are not JSON or carry an unknown `type` parse to
//! `None` and are ignored. Inside `control`, each field is type-checked on
//! its own: a field of the wrong type is dropped without affecting the rest.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broadcast::Notification;
use crate::collector::{CaptureStatus, ClearTarget, History};
use crate::policy::{PolicyPatch, PolicySnapshot};
use crate::types::{LogRecord, NetworkRecord};

/// A message sent to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Log { data: Arc<LogRecord> },
    Network { data: Arc<NetworkRecord> },
    Batch { data: History },
    Status { data: CaptureStatus },
    Config { data: PolicySnapshot },
    Clear { target: ClearTarget },
}

impl ServerMessage {
    /// Serializes the message to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error only if a record holds data JSON cannot represent.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<Notification> for ServerMessage {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::Log(data) => Self::Log { data },
            Notification::Network(data) => Self::Network { data },
            Notification::Cleared(target) => Self::Clear { target },
            Notification::Status(data) => Self::Status { data },
            Notification::Config(data) => Self::Config { data },
        }
    }
}

/// A message received from an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Clear { target: ClearTarget },
    Control { data: ControlPatch },
}

impl ClientMessage {
    /// Parses an inbound text frame. Returns `None` for anything malformed.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// Body of a `control` message.
///
/// Fields are kept as raw JSON so that one mistyped field does not reject
/// the whole message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_logs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_network: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_body_bytes: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_request_bodies: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_response_bodies: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact_headers: Option<Value>,
}

impl ControlPatch {
    /// Requested log pause state, if given as a boolean.
    #[must_use]
    pub fn pause_logs(&self) -> Option<bool> {
        self.pause_logs.as_ref().and_then(Value::as_bool)
    }

    /// Requested network pause state, if given as a boolean.
    #[must_use]
    pub fn pause_network(&self) -> Option<bool> {
        self.pause_network.as_ref().and_then(Value::as_bool)
    }

    /// Extracts the well-typed policy fields.
    ///
    /// `truncateBodyBytes` must be a number, the body flags booleans, and
    /// `redactHeaders` an array made only of strings.
    #[must_use]
    pub fn policy_patch(&self) -> PolicyPatch {
        PolicyPatch {
            truncate_body_bytes: self.truncate_body_bytes.as_ref().and_then(Value::as_f64),
            capture_request_bodies: self.capture_request_bodies.as_ref().and_then(Value::as_bool),
            capture_response_bodies: self
                .capture_response_bodies
                .as_ref()
                .and_then(Value::as_bool),
            redact_headers: self.redact_headers.as_ref().and_then(string_array),
        }
    }
}

fn string_array(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}
