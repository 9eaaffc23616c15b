//! Capture sources and the producer-side boundary.
//!
//! Producers reach the collector through a [`Capture`]: the collector, the
//! live policy and the in-flight call tracker of one session. A
//! [`CaptureHooks`] slot holds the capture of the running session, if any.
//! The concrete sources ([`LogCaptureLayer`](log_layer::LogCaptureLayer) and
//! [`CapturingClient`](client::CapturingClient)) look the slot up on every
//! event, so once a session shuts down and uninstalls itself they behave
//! exactly like an uninstrumented subscriber layer and HTTP client.
//!
//! Everything a producer does on the capture path runs inside [`fail_open`]:
//! errors and panics are logged at debug level and the event is dropped.

pub mod client;
pub mod log_layer;
pub mod network;

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use tracing::debug;

use crate::collector::EventCollector;
use crate::error::CaptureError;
use crate::policy::CapturePolicy;
use crate::types::{LogRecord, Severity};

use self::network::NetworkTracker;

/// Runs capture work, swallowing every failure.
///
/// Returns `None` if `work` returned an error or panicked. Nothing from the
/// capture path ever reaches the caller.
pub fn fail_open<T>(context: &'static str, work: impl FnOnce() -> Result<T, CaptureError>) -> Option<T> {
    let error = match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => return Some(value),
        Ok(Err(error)) => error,
        Err(payload) => CaptureError::from_panic(payload.as_ref()),
    };
    debug!(context, error = %error, "Dropped captured event");
    None
}

/// The capture endpoints of one session.
#[derive(Debug, Clone)]
pub struct Capture {
    collector: Arc<EventCollector>,
    policy: Arc<CapturePolicy>,
    network: Arc<NetworkTracker>,
}

impl Capture {
    /// Bundles a collector and policy, creating a fresh call tracker.
    #[must_use]
    pub fn new(collector: Arc<EventCollector>, policy: Arc<CapturePolicy>) -> Self {
        let network = Arc::new(NetworkTracker::new(
            Arc::clone(&collector),
            Arc::clone(&policy),
        ));
        Self {
            collector,
            policy,
            network,
        }
    }

    #[must_use]
    pub fn collector(&self) -> &Arc<EventCollector> {
        &self.collector
    }

    #[must_use]
    pub fn policy(&self) -> &Arc<CapturePolicy> {
        &self.policy
    }

    /// Tracker for in-flight network calls.
    #[must_use]
    pub fn network(&self) -> &Arc<NetworkTracker> {
        &self.network
    }

    /// Records a log message.
    ///
    /// `stack` is kept only for [`Severity::Error`]. Returns `true` if the
    /// record was stored (the log channel was not paused).
    pub fn on_log(
        &self,
        level: Severity,
        message: impl Into<String>,
        args: Map<String, Value>,
        stack: Option<String>,
    ) -> bool {
        let record = LogRecord::new(level, message, args).with_stack(stack);
        self.collector.add_log(record)
    }
}

/// Install slot for the running session's [`Capture`].
///
/// Capture sources hold an `Arc<CaptureHooks>` and consult it per event.
#[derive(Debug, Default)]
pub struct CaptureHooks {
    slot: RwLock<Option<Capture>>,
}

impl CaptureHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes captured events to `capture`, replacing any previous target.
    pub fn install(&self, capture: Capture) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(capture);
        debug!("Capture hooks installed");
    }

    /// Stops routing events anywhere and returns the previous target.
    pub fn uninstall(&self) -> Option<Capture> {
        let previous = self
            .slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            debug!("Capture hooks uninstalled");
        }
        previous
    }

    /// Returns the installed capture, if any.
    #[must_use]
    pub fn current(&self) -> Option<Capture> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Notifier;
    use crate::capture::network::CallId;
    use crate::policy::PolicySnapshot;

    fn capture() -> Capture {
        Capture::new(
            Arc::new(EventCollector::new(10, 10, Notifier::new())),
            Arc::new(CapturePolicy::new(PolicySnapshot::default(), 10)),
        )
    }

    // ========================================================================
    // fail_open
    // ========================================================================

    #[test]
    fn fail_open_passes_values_through() {
        assert_eq!(fail_open("test", || Ok(5)), Some(5));
    }

    #[test]
    fn fail_open_swallows_errors() {
        let result: Option<()> =
            fail_open("test", || Err(CaptureError::UnknownCall(CallId::from_raw(1))));
        assert!(result.is_none());
    }

    #[test]
    fn fail_open_swallows_panics() {
        let result: Option<u8> = fail_open("test", || panic!("capture bug"));
        assert!(result.is_none());
    }

    // ========================================================================
    // Capture
    // ========================================================================

    #[test]
    fn on_log_keeps_stack_only_for_errors() {
        let capture = capture();
        capture.on_log(Severity::Warn, "careful", Map::new(), Some("frame".into()));
        capture.on_log(Severity::Error, "broken", Map::new(), Some("frame".into()));

        let logs = capture.collector().get_logs();
        assert!(logs[0].stack.is_none());
        assert_eq!(logs[1].stack.as_deref(), Some("frame"));
    }

    // ========================================================================
    // CaptureHooks
    // ========================================================================

    #[test]
    fn hooks_start_empty() {
        let hooks = CaptureHooks::new();
        assert!(!hooks.is_installed());
        assert!(hooks.current().is_none());
    }

    #[test]
    fn install_then_uninstall() {
        let hooks = CaptureHooks::new();
        let capture = capture();
        hooks.install(capture.clone());

        let current = hooks.current().unwrap();
        assert!(Arc::ptr_eq(current.collector(), capture.collector()));

        assert!(hooks.uninstall().is_some());
        assert!(!hooks.is_installed());
        assert!(hooks.uninstall().is_none());
    }
}
