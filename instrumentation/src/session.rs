//! Capture session lifecycle.
//!
//! A session wires one [`CapturePolicy`], one [`EventCollector`], the capture
//! sources and a [`BroadcastHub`] together. At most one session is active per
//! [`SessionRegistry`]:
//!
//! - [`SessionRegistry::start`] returns the active session if there is one,
//!   otherwise builds a new one and installs its capture hooks.
//! - [`SessionHandle::shutdown`] uninstalls the hooks, stops the observer
//!   listener and frees the registry for the next `start`.
//!
//! A listener that cannot bind is reported with a warning; the session still
//! captures and can be inspected through [`SessionHandle::capture`].
//!
//! # Runtime
//!
//! When `start` is called from inside a tokio runtime the hub runs on it.
//! Otherwise the session owns a single-worker runtime named
//! `server-devtools`, stopped on shutdown.
//!
//! # Example
//!
//! ```rust,no_run
//! use server_devtools::config::SessionConfig;
//! use server_devtools::session::SessionRegistry;
//!
//! let registry = SessionRegistry::new();
//! let session = registry.start(SessionConfig::default());
//! assert!(session.ptr_eq(&registry.start(SessionConfig::default())));
//!
//! session.shutdown();
//! assert!(registry.active().is_none());
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::Notifier;
use crate::capture::client::CapturingClient;
use crate::capture::log_layer::LogCaptureLayer;
use crate::capture::{Capture, CaptureHooks};
use crate::collector::EventCollector;
use crate::config::SessionConfig;
use crate::error::HubError;
use crate::hub::{BroadcastHub, RunningHub};
use crate::policy::CapturePolicy;

/// Thread name of the runtime a session creates when none is running.
const RUNTIME_THREAD_NAME: &str = "server-devtools";

// ============================================================================
// Registry
// ============================================================================

/// Holds the active session and the capture hooks its sources feed.
///
/// Cloning is cheap; clones share the same active slot.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

#[derive(Debug, Default)]
struct RegistryShared {
    active: Mutex<Option<SessionHandle>>,
    hooks: Arc<CaptureHooks>,
}

impl RegistryShared {
    fn active(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`crate::start`].
    pub fn global() -> &'static SessionRegistry {
        static GLOBAL: OnceLock<SessionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SessionRegistry::new)
    }

    /// Hooks consulted by this registry's capture sources.
    #[must_use]
    pub fn hooks(&self) -> &Arc<CaptureHooks> {
        &self.shared.hooks
    }

    /// A `tracing` layer feeding whichever session is active.
    #[must_use]
    pub fn log_layer(&self) -> LogCaptureLayer {
        LogCaptureLayer::new(Arc::clone(&self.shared.hooks))
    }

    /// An HTTP client recording calls into whichever session is active.
    #[must_use]
    pub fn capturing_client(&self) -> CapturingClient {
        CapturingClient::new(Arc::clone(&self.shared.hooks))
    }

    /// The active session, if any.
    #[must_use]
    pub fn active(&self) -> Option<SessionHandle> {
        self.shared.active().clone()
    }

    /// Starts capturing, or returns the already active session.
    ///
    /// An active session is returned whatever `config` says. Otherwise a
    /// disabled `config` yields an inert handle that is never registered.
    /// Never fails: a listener that cannot bind is logged and skipped.
    pub fn start(&self, config: SessionConfig) -> SessionHandle {
        let mut active = self.shared.active();
        if let Some(existing) = active.as_ref() {
            debug!(session = %existing.id(), "Capture session already active");
            return existing.clone();
        }

        if !config.enabled {
            debug!("Capture disabled by configuration");
            return SessionHandle::disabled();
        }

        let config = config.normalized();
        let collector = Arc::new(EventCollector::new(
            config.max_logs,
            config.max_requests,
            Notifier::with_capacity(config.channel_capacity),
        ));
        let policy = Arc::new(CapturePolicy::new(
            config.policy(),
            config.min_truncate_body_bytes,
        ));
        let capture = Capture::new(Arc::clone(&collector), Arc::clone(&policy));
        self.shared.hooks.install(capture.clone());

        let (hub, runtime) = match launch_hub(BroadcastHub::new(collector, policy), &config) {
            Ok((hub, runtime)) => (Some(hub), runtime),
            Err(err) => {
                warn!(
                    error = %err,
                    address = %config.listen_addr(),
                    addr_in_use = err.is_addr_in_use(),
                    "Observer listener unavailable, capture continues without observers"
                );
                (None, None)
            }
        };

        let handle = SessionHandle {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                active: AtomicBool::new(true),
                capture: Some(capture),
                hooks: Arc::clone(&self.shared.hooks),
                local_addr: hub.as_ref().map(RunningHub::local_addr),
                hub: Mutex::new(hub),
                runtime: Mutex::new(runtime),
                registry: Arc::downgrade(&self.shared),
            }),
        };

        info!(
            session = %handle.id(),
            address = ?handle.local_addr(),
            max_logs = config.max_logs,
            max_requests = config.max_requests,
            "Capture session started"
        );

        *active = Some(handle.clone());
        handle
    }
}

/// Binds the listener and serves `hub` on the ambient or an owned runtime.
fn launch_hub(
    hub: BroadcastHub,
    config: &SessionConfig,
) -> Result<(RunningHub, Option<Runtime>), HubError> {
    let listen_addr = config.listen_addr();
    let addr = listen_addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| HubError::Address(listen_addr.clone()))?;

    let (handle, runtime) = match Handle::try_current() {
        Ok(handle) => (handle, None),
        Err(_) => {
            let runtime = Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name(RUNTIME_THREAD_NAME)
                .enable_all()
                .build()
                .map_err(HubError::Runtime)?;
            (runtime.handle().clone(), Some(runtime))
        }
    };

    let listener = std::net::TcpListener::bind(addr).map_err(|err| HubError::from((addr, err)))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| HubError::from((addr, err)))?;
    let listener = {
        let _guard = handle.enter();
        tokio::net::TcpListener::from_std(listener).map_err(|err| HubError::from((addr, err)))?
    };

    let running = hub.serve_on(listener, &handle)?;
    Ok((running, runtime))
}

// ============================================================================
// Handle
// ============================================================================

/// A started (or disabled) capture session.
///
/// Clones refer to the same session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: Uuid,
    active: AtomicBool,
    capture: Option<Capture>,
    hooks: Arc<CaptureHooks>,
    local_addr: Option<SocketAddr>,
    hub: Mutex<Option<RunningHub>>,
    runtime: Mutex<Option<Runtime>>,
    registry: Weak<RegistryShared>,
}

impl SessionInner {
    fn stop(&self) {
        if let Some(hub) = self.hub.lock().unwrap_or_else(PoisonError::into_inner).take() {
            hub.shutdown();
        }
        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runtime.shutdown_background();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Dropping a Runtime inside async code panics.
        self.stop();
    }
}

impl SessionHandle {
    fn disabled() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::nil(),
                active: AtomicBool::new(false),
                capture: None,
                hooks: Arc::default(),
                local_addr: None,
                hub: Mutex::new(None),
                runtime: Mutex::new(None),
                registry: Weak::new(),
            }),
        }
    }

    /// Session id, nil for a disabled handle.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// `false` if the session was started with capture disabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.capture.is_some()
    }

    /// `true` until [`shutdown`](Self::shutdown) is called.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Collector, policy and call tracker of this session.
    #[must_use]
    pub fn capture(&self) -> Option<&Capture> {
        self.inner.capture.as_ref()
    }

    /// Address observers connect to, `None` if the listener did not bind.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// Returns `true` if both handles refer to the same session.
    #[must_use]
    pub fn ptr_eq(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stops capturing and disconnects observers. Idempotent.
    ///
    /// Producers behave as if never instrumented once this returns. Buffered
    /// records stay readable through [`capture`](Self::capture).
    pub fn shutdown(&self) {
        if !self.inner.active.swap(false, Ordering::AcqRel) {
            return;
        }

        let registry = self.inner.registry.upgrade();
        let mut active = registry.as_ref().map(|registry| registry.active());

        self.inner.hooks.uninstall();
        self.inner.stop();
        if let Some(active) = active.as_mut() {
            if active.as_ref().is_some_and(|current| current.ptr_eq(self)) {
                **active = None;
            }
        }

        info!(session = %self.id(), "Capture session stopped");
    }
}
