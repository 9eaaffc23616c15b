//! Error types for the capture layer.
//!
//! # Error Types
//!
//! - [`CaptureError`] - failures inside capture sources. These never reach
//!   the host process; [`fail_open`](crate::capture::fail_open) logs and
//!   discards them.
//! - [`HubError`] - failures starting the observer listener. Reported by
//!   [`BroadcastHub::bind`](crate::hub::BroadcastHub::bind); a session treats
//!   them as warnings and keeps capturing.
//!
//! Configuration errors live next to the environment parser in
//! [`config`](crate::config).

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::capture::network::CallId;

/// A failure while constructing or recording a captured event.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// `finish`/`fail` was called with an id that is not in flight.
    #[error("no in-flight call with id {0}")]
    UnknownCall(CallId),

    /// Capture code panicked.
    #[error("capture panicked: {0}")]
    Panicked(String),
}

impl CaptureError {
    /// Builds a [`CaptureError::Panicked`] from a `catch_unwind` payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::Panicked(message)
    }
}

/// A failure starting or running the observer listener.
#[derive(Debug, Error)]
pub enum HubError {
    /// The listen address could not be bound.
    #[error("failed to bind observer listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listen address did not resolve.
    #[error("invalid listen address '{0}'")]
    Address(String),

    /// No tokio runtime was available and one could not be created.
    #[error("failed to create capture runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl HubError {
    /// Creates a bind error for `addr`.
    pub fn bind(addr: impl ToString, source: io::Error) -> Self {
        Self::Bind {
            addr: addr.to_string(),
            source,
        }
    }

    /// Returns `true` if the listen address was already taken.
    #[must_use]
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, Self::Bind { source, .. } if source.kind() == io::ErrorKind::AddrInUse)
    }
}

impl From<(SocketAddr, io::Error)> for HubError {
    fn from((addr, source): (SocketAddr, io::Error)) -> Self {
        Self::bind(addr, source)
    }
}
