//! Server DevTools - live log and network capture for running processes.
//!
//! This crate records what a process logs and which HTTP calls it makes,
//! keeps a bounded history of both, and streams it to observers connected
//! over WebSocket:
//! - Capturing `tracing` events and `reqwest` calls
//! - Truncating bodies and redacting sensitive headers
//! - Broadcasting records, pause state and policy changes to observers
//!
//! # Architecture
//!
//! Capture sources ([`capture`]) feed an [`EventCollector`](collector::EventCollector)
//! holding two ring buffers. Every change is published on a
//! [`Notifier`](broadcast::Notifier) and fanned out by the
//! [`BroadcastHub`](hub::BroadcastHub). A [`session`] ties them together and
//! guarantees that at most one is running.
//!
//! Capture never fails the host: errors inside capture code are logged at
//! debug level and the event is dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! use tracing_subscriber::prelude::*;
//!
//! let session = server_devtools::start(server_devtools::config::SessionConfig::default());
//! tracing_subscriber::registry()
//!     .with(server_devtools::log_layer())
//!     .init();
//!
//! tracing::info!("visible to observers on ws://127.0.0.1:3001");
//! session.shutdown();
//! ```

pub mod broadcast;
pub mod capture;
pub mod collector;
pub mod config;
pub mod error;
pub mod hub;
pub mod policy;
pub mod protocol;
pub mod ring_buffer;
pub mod session;
pub mod types;

use capture::client::CapturingClient;
use capture::log_layer::LogCaptureLayer;
use config::SessionConfig;
use session::{SessionHandle, SessionRegistry};

/// Starts the process-wide capture session, or returns the running one.
pub fn start(config: SessionConfig) -> SessionHandle {
    SessionRegistry::global().start(config)
}

/// A `tracing` layer feeding the process-wide session.
#[must_use]
pub fn log_layer() -> LogCaptureLayer {
    SessionRegistry::global().log_layer()
}

/// An HTTP client recorded by the process-wide session.
#[must_use]
pub fn capturing_client() -> CapturingClient {
    SessionRegistry::global().capturing_client()
}
