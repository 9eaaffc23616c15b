//! Log capture source for `tracing`.
//!
//! [`LogCaptureLayer`] is a [`tracing_subscriber::Layer`] that turns every
//! event into a [`LogRecord`]. Add it to the host's subscriber next to
//! whatever formatting layer is already there; it never changes what other
//! layers see.
//!
//! ```rust,no_run
//! use tracing_subscriber::prelude::*;
//!
//! let session = server_devtools::start(Default::default());
//!
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(server_devtools::log_layer())
//!     .init();
//!
//! tracing::info!(port = 8080, "listening");
//! # drop(session);
//! ```
//!
//! Events from this crate and from the WebSocket transport are skipped, as
//! is any event emitted while the layer is already capturing on the same
//! thread. Otherwise a log line about an observer send would itself be
//! captured and broadcast, forever.

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{fail_open, CaptureHooks};
use crate::types::{LogRecord, Severity};

/// Crate targets skipped by default, along with their submodules.
const DEFAULT_IGNORED_TARGETS: [&str; 3] = ["server_devtools", "tungstenite", "tokio_tungstenite"];

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as capturing until dropped.
struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        CAPTURING.with(|capturing| {
            if capturing.replace(true) {
                None
            } else {
                Some(Self)
            }
        })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        CAPTURING.with(|capturing| capturing.set(false));
    }
}

/// A `tracing` layer that forwards events to the installed capture session.
#[derive(Debug, Clone)]
pub struct LogCaptureLayer {
    hooks: Arc<CaptureHooks>,
    ignored_targets: Vec<String>,
}

impl LogCaptureLayer {
    /// Creates a layer that feeds whatever session is installed in `hooks`.
    #[must_use]
    pub fn new(hooks: Arc<CaptureHooks>) -> Self {
        Self {
            hooks,
            ignored_targets: DEFAULT_IGNORED_TARGETS
                .iter()
                .map(|target| (*target).to_string())
                .collect(),
        }
    }

    /// Skips events whose target is `prefix` or one of its `prefix::` submodules.
    #[must_use]
    pub fn ignore_target(mut self, prefix: impl Into<String>) -> Self {
        self.ignored_targets.push(prefix.into());
        self
    }

    fn is_ignored(&self, target: &str) -> bool {
        self.ignored_targets
            .iter()
            .any(|prefix| match target.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with("::"),
                None => false,
            })
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if self.is_ignored(metadata.target()) {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return;
        };
        let Some(capture) = self.hooks.current() else {
            return;
        };

        fail_open("log", || {
            let level = Severity::from(metadata.level());
            let mut visitor = FieldVisitor::default();
            event.record(&mut visitor);

            let message = visitor.render();
            let stack = (level == Severity::Error).then(|| Backtrace::force_capture().to_string());
            let record = LogRecord::new(level, message, visitor.fields)
                .with_target(metadata.target())
                .with_stack(stack);
            capture.collector().add_log(record);
            Ok(())
        });
    }
}

/// Collects the `message` field and the remaining fields as JSON.
#[derive(Debug, Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    /// Renders `message key=value ...`, the way the fmt layer prints events.
    fn render(&self) -> String {
        let mut out = self.message.clone().unwrap_or_default();
        for (name, value) in &self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            match value {
                Value::String(text) => {
                    let _ = write!(out, "{name}={text}");
                }
                other => {
                    let _ = write!(out, "{name}={other}");
                }
            }
        }
        out
    }

    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.insert(field, Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}
