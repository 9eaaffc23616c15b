//! Bounded capture history and change notifications.
//!
//! [`EventCollector`] owns the log and network ring buffers together with the
//! two pause flags. Every mutation publishes a [`Notification`] on the
//! collector's [`Notifier`].
//!
//! # Consistency
//!
//! All state sits behind one mutex and notifications are published while it
//! is held, so the order of notifications on the channel is the order the
//! buffers were mutated in. [`EventCollector::subscribe_with_history`]
//! subscribes and snapshots under the same lock: a record is either part of
//! the returned history or arrives later as a notification, never both and
//! never neither. Publishing is a non-blocking channel send, so holding the
//! lock across it never waits on an observer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::Receiver;
use tracing::debug;

use crate::broadcast::{Notification, Notifier};
use crate::ring_buffer::RingBuffer;
use crate::types::{LogRecord, NetworkRecord};

/// Default number of log records kept.
pub const DEFAULT_MAX_LOGS: usize = 10_000;

/// Default number of network records kept.
pub const DEFAULT_MAX_REQUESTS: usize = 5_000;

/// One of the two independently pausable capture channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Logs,
    Network,
}

/// Which buffer(s) a clear applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClearTarget {
    Logs,
    Network,
    All,
}

impl ClearTarget {
    /// Returns `true` if clearing this target empties the given channel.
    #[must_use]
    pub fn includes(&self, channel: Channel) -> bool {
        matches!(
            (self, channel),
            (Self::All, _) | (Self::Logs, Channel::Logs) | (Self::Network, Channel::Network)
        )
    }
}

/// Current pause flags. Payload of the `status` protocol message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStatus {
    pub paused_logs: bool,
    pub paused_network: bool,
}

impl CaptureStatus {
    /// Returns the pause flag for a channel.
    #[must_use]
    pub fn is_paused(&self, channel: Channel) -> bool {
        match channel {
            Channel::Logs => self.paused_logs,
            Channel::Network => self.paused_network,
        }
    }
}

/// Full buffer contents. Payload of the `batch` protocol message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub logs: Vec<Arc<LogRecord>>,
    pub requests: Vec<Arc<NetworkRecord>>,
}

#[derive(Debug)]
struct CollectorState {
    logs: RingBuffer<Arc<LogRecord>>,
    requests: RingBuffer<Arc<NetworkRecord>>,
    status: CaptureStatus,
}

/// Thread-safe owner of the capture history.
///
/// No operation fails. The collector is shared behind an `Arc` between
/// capture sources and the hub.
///
/// # Example
///
/// ```rust
/// use server_devtools::broadcast::Notifier;
/// use server_devtools::collector::{Channel, EventCollector};
/// use server_devtools::types::{LogRecord, Severity};
///
/// let collector = EventCollector::new(100, 100, Notifier::new());
///
/// collector.set_paused(Channel::Logs, true);
/// collector.add_log(LogRecord::new(Severity::Info, "a", Default::default()));
/// assert!(collector.get_logs().is_empty());
///
/// collector.set_paused(Channel::Logs, false);
/// collector.add_log(LogRecord::new(Severity::Info, "b", Default::default()));
/// assert_eq!(collector.get_logs()[0].message, "b");
/// ```
#[derive(Debug)]
pub struct EventCollector {
    state: Mutex<CollectorState>,
    notifier: Notifier,
}

impl EventCollector {
    /// Creates a collector with the given buffer capacities.
    ///
    /// Capacities below 1 are clamped to 1.
    #[must_use]
    pub fn new(max_logs: usize, max_requests: usize, notifier: Notifier) -> Self {
        debug!(max_logs, max_requests, "Created event collector");
        Self {
            state: Mutex::new(CollectorState {
                logs: RingBuffer::new(max_logs),
                requests: RingBuffer::new(max_requests),
                status: CaptureStatus::default(),
            }),
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        // A producer that panicked mid-push cannot leave the buffers in an
        // invalid state, so poisoning is ignored.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the notifier this collector publishes on.
    #[must_use]
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Appends a log record unless the log channel is paused.
    ///
    /// Returns `true` if the record was stored and published.
    pub fn add_log(&self, record: LogRecord) -> bool {
        let mut state = self.lock();
        if state.status.paused_logs {
            return false;
        }
        let record = Arc::new(record);
        state.logs.push(Arc::clone(&record));
        self.notifier.publish(Notification::Log(record));
        true
    }

    /// Appends a network record unless the network channel is paused.
    ///
    /// Returns `true` if the record was stored and published.
    pub fn add_network(&self, record: NetworkRecord) -> bool {
        let mut state = self.lock();
        if state.status.paused_network {
            return false;
        }
        let record = Arc::new(record);
        state.requests.push(Arc::clone(&record));
        self.notifier.publish(Notification::Network(record));
        true
    }

    /// Empties the targeted buffer(s), regardless of pause state.
    pub fn clear(&self, target: ClearTarget) {
        let mut state = self.lock();
        if target.includes(Channel::Logs) {
            state.logs.clear();
        }
        if target.includes(Channel::Network) {
            state.requests.clear();
        }
        debug!(?target, "Cleared capture history");
        self.notifier.publish(Notification::Cleared(target));
    }

    /// Sets a channel's pause flag and publishes the resulting status.
    pub fn set_paused(&self, channel: Channel, paused: bool) {
        let mut state = self.lock();
        match channel {
            Channel::Logs => state.status.paused_logs = paused,
            Channel::Network => state.status.paused_network = paused,
        }
        let status = state.status;
        debug!(?channel, paused, "Capture pause state changed");
        self.notifier.publish(Notification::Status(status));
    }

    /// Returns the buffered log records, oldest first.
    #[must_use]
    pub fn get_logs(&self) -> Vec<Arc<LogRecord>> {
        self.lock().logs.snapshot()
    }

    /// Returns the buffered network records, oldest first.
    #[must_use]
    pub fn get_requests(&self) -> Vec<Arc<NetworkRecord>> {
        self.lock().requests.snapshot()
    }

    /// Returns the current pause flags.
    #[must_use]
    pub fn get_status(&self) -> CaptureStatus {
        self.lock().status
    }

    /// Returns both buffers, read under one lock.
    #[must_use]
    pub fn history(&self) -> History {
        let state = self.lock();
        History {
            logs: state.logs.snapshot(),
            requests: state.requests.snapshot(),
        }
    }

    /// Returns `(log count, network record count)`.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.logs.size(), state.requests.size())
    }

    /// Subscribes to notifications and snapshots the current state atomically.
    ///
    /// Every record stored after this call arrives on the receiver; every
    /// record stored before it is in the returned history.
    #[must_use]
    pub fn subscribe_with_history(&self) -> (Receiver<Notification>, History, CaptureStatus) {
        let state = self.lock();
        let rx = self.notifier.subscribe();
        let history = History {
            logs: state.logs.snapshot(),
            requests: state.requests.snapshot(),
        };
        (rx, history, state.status)
    }
}
