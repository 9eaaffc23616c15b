//! Change notification fan-out.
//!
//! The collector and the hub never talk to observers directly. Every state
//! change is published as a [`Notification`] on a [`Notifier`], a thin wrapper
//! around tokio's broadcast channel, and each observer connection holds its
//! own receiver.
//!
//! Publishing never blocks. When a receiver falls more than the channel
//! capacity behind it gets `RecvError::Lagged` on its next receive, and the
//! hub re-sends that observer a full baseline.
//!
//! # Example
//!
//! ```rust
//! use server_devtools::broadcast::{Notification, Notifier};
//! use server_devtools::collector::ClearTarget;
//!
//! let notifier = Notifier::new();
//! let mut rx = notifier.subscribe();
//!
//! assert_eq!(notifier.publish(Notification::Cleared(ClearTarget::All)), 1);
//! assert!(matches!(rx.try_recv(), Ok(Notification::Cleared(ClearTarget::All))));
//! ```

use std::sync::Arc;

use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::collector::{CaptureStatus, ClearTarget};
use crate::policy::PolicySnapshot;
use crate::types::{LogRecord, NetworkRecord};

/// Default channel capacity.
///
/// An observer that falls this many notifications behind is re-baselined.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// A state change published to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A log record was appended.
    Log(Arc<LogRecord>),

    /// A network record was appended.
    Network(Arc<NetworkRecord>),

    /// One or both buffers were emptied.
    Cleared(ClearTarget),

    /// A pause flag changed. Carries both current flags.
    Status(CaptureStatus),

    /// The capture policy changed. Carries the full new policy.
    Config(PolicySnapshot),
}

impl Notification {
    /// Short name used in diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Network(_) => "network",
            Self::Cleared(_) => "clear",
            Self::Status(_) => "status",
            Self::Config(_) => "config",
        }
    }
}

/// Publisher side of the notification channel.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: Sender<Notification>,
}

impl Notifier {
    /// Creates a notifier with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a notifier with the given channel capacity.
    ///
    /// A capacity of 0 is clamped to 1.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        debug!(capacity, "Created notifier");
        Self { sender }
    }

    /// Subscribes to notifications published from now on.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<Notification> {
        let rx = self.sender.subscribe();
        debug!(
            subscriber_count = self.subscriber_count(),
            "New notification subscriber"
        );
        rx
    }

    /// Publishes a notification to every current subscriber.
    ///
    /// Returns the number of subscribers it was queued for. Having no
    /// subscribers is normal (no observer attached) and returns 0.
    pub fn publish(&self, notification: Notification) -> usize {
        let kind = notification.kind();
        match self.sender.send(notification) {
            Ok(receivers) => {
                trace!(kind, receivers, "Published notification");
                receivers
            }
            Err(_) => 0,
        }
    }

    /// Returns the number of live receivers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
