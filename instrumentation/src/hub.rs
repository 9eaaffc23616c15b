//! Observer hub: WebSocket fan-out of capture state.
//!
//! [`BroadcastHub`] serves two routes:
//!
//! - `GET /` - WebSocket endpoint for observers (see [`protocol`](crate::protocol))
//! - `GET /health` - JSON status for scripts and probes
//!
//! # Connection lifecycle
//!
//! A new observer receives `batch`, `status` and `config`, in that order,
//! before any live message. The history in `batch` and the live stream are
//! split atomically by [`EventCollector::subscribe_with_history`], so every
//! record shows up exactly once.
//!
//! Each observer has its own notification receiver and its own send task;
//! a slow or broken observer never holds up producers or other observers.
//! An observer that falls too far behind is sent a fresh baseline.
//!
//! Inbound `clear` and `control` messages are applied to the collector and
//! policy; the resulting `clear`, `status` and `config` messages go to every
//! observer, the sender included. Anything unparseable is ignored.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use server_devtools::broadcast::Notifier;
//! use server_devtools::collector::EventCollector;
//! use server_devtools::hub::BroadcastHub;
//! use server_devtools::policy::{CapturePolicy, PolicySnapshot};
//!
//! # async fn demo() -> Result<(), server_devtools::error::HubError> {
//! let collector = Arc::new(EventCollector::new(10_000, 5_000, Notifier::new()));
//! let policy = Arc::new(CapturePolicy::new(PolicySnapshot::default(), 1_000));
//!
//! let running = BroadcastHub::new(collector, policy).bind("127.0.0.1:3001").await?;
//! println!("observers connect to ws://{}", running.local_addr());
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use crate::broadcast::Notification;
use crate::collector::{Channel, EventCollector};
use crate::error::HubError;
use crate::policy::CapturePolicy;
use crate::protocol::{ClientMessage, ServerMessage};

// ============================================================================
// Hub
// ============================================================================

/// Shared state behind every observer connection.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    collector: Arc<EventCollector>,
    policy: Arc<CapturePolicy>,
    observers: Arc<AtomicUsize>,
    stop: Arc<watch::Sender<bool>>,
    start_time: Instant,
}

impl BroadcastHub {
    #[must_use]
    pub fn new(collector: Arc<EventCollector>, policy: Arc<CapturePolicy>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            collector,
            policy,
            observers: Arc::new(AtomicUsize::new(0)),
            stop: Arc::new(stop),
            start_time: Instant::now(),
        }
    }

    /// Number of currently connected observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.observers.load(Ordering::Relaxed)
    }

    /// Builds the axum router serving observers and `/health`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(get_ws))
            .route("/health", get(get_health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Binds `addr` and serves observers on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bind`] if the address cannot be bound.
    pub async fn bind(self, addr: &str) -> Result<RunningHub, HubError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| HubError::bind(addr, err))?;
        self.serve_on(listener, &Handle::current())
    }

    /// Serves observers from `listener` on the given runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Bind`] if the listener has no local address.
    pub fn serve_on(self, listener: TcpListener, runtime: &Handle) -> Result<RunningHub, HubError> {
        let local_addr = listener
            .local_addr()
            .map_err(|err| HubError::bind("<listener>", err))?;
        let router = self.router();
        let mut stopped = self.stop.subscribe();

        let task = runtime.spawn(async move {
            let shutdown = async move { wait_stopped(&mut stopped).await };
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!(error = %err, "Observer listener failed");
            }
        });

        info!(address = %local_addr, "Observer hub listening");
        Ok(RunningHub {
            local_addr,
            hub: self,
            task,
        })
    }

    /// Subscribes and builds the three baseline messages for a new observer.
    fn baseline(&self) -> (Receiver<Notification>, [ServerMessage; 3]) {
        let (rx, history, status) = self.collector.subscribe_with_history();
        let messages = [
            ServerMessage::Batch { data: history },
            ServerMessage::Status { data: status },
            ServerMessage::Config {
                data: self.policy.snapshot(),
            },
        ];
        (rx, messages)
    }

    /// Applies an inbound observer message.
    pub fn apply(&self, message: ClientMessage) {
        match message {
            ClientMessage::Clear { target } => self.collector.clear(target),
            ClientMessage::Control { data } => {
                if let Some(paused) = data.pause_logs() {
                    self.collector.set_paused(Channel::Logs, paused);
                }
                if let Some(paused) = data.pause_network() {
                    self.collector.set_paused(Channel::Network, paused);
                }

                let patch = data.policy_patch();
                if !patch.is_empty() {
                    let snapshot = self.policy.apply_patch(&patch);
                    debug!(policy = ?snapshot, "Capture policy updated");
                    self.collector
                        .notifier()
                        .publish(Notification::Config(snapshot));
                }
            }
        }
    }

    fn stop_connections(&self) {
        self.stop.send_replace(true);
    }
}

/// Resolves once the hub is told to stop.
async fn wait_stopped(stopped: &mut watch::Receiver<bool>) {
    while !*stopped.borrow_and_update() {
        if stopped.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// Running listener
// ============================================================================

/// A hub serving on a bound listener.
///
/// Dropping it stops the listener and disconnects every observer.
#[derive(Debug)]
pub struct RunningHub {
    local_addr: SocketAddr,
    hub: BroadcastHub,
    task: JoinHandle<()>,
}

impl RunningHub {
    /// The address observers connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Stops accepting observers and closes existing connections. Idempotent.
    pub fn shutdown(&self) {
        if !self.task.is_finished() {
            info!(address = %self.local_addr, "Observer hub stopping");
        }
        self.hub.stop_connections();
        self.task.abort();
    }
}

impl Drop for RunningHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// GET / - Observer WebSocket
// ============================================================================

async fn get_ws(State(hub): State<BroadcastHub>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_observer(socket, hub))
}

/// Decrements the observer count when the connection ends.
struct ObserverGuard(Arc<AtomicUsize>);

impl ObserverGuard {
    fn register(observers: &Arc<AtomicUsize>) -> Self {
        observers.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(observers))
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

type ObserverSink = SplitSink<WebSocket, Message>;

/// Sends one message. Returns `false` once the observer is gone.
async fn send(sink: &mut ObserverSink, message: &ServerMessage) -> bool {
    let json = match message.to_json() {
        Ok(json) => json,
        Err(err) => {
            debug!(error = %err, "Failed to serialize observer message");
            return true;
        }
    };
    match sink.send(Message::Text(json.into())).await {
        Ok(()) => true,
        Err(err) => {
            debug!(error = %err, "Failed to send to observer");
            false
        }
    }
}

async fn send_all(sink: &mut ObserverSink, messages: &[ServerMessage]) -> bool {
    for message in messages {
        if !send(sink, message).await {
            return false;
        }
    }
    true
}

async fn handle_observer(socket: WebSocket, hub: BroadcastHub) {
    let (mut sender, mut receiver) = socket.split();
    let mut stopped = hub.stop.subscribe();
    let _guard = ObserverGuard::register(&hub.observers);
    let (mut rx, baseline) = hub.baseline();

    info!(observers = hub.observer_count(), "Observer connected");

    let forward_hub = hub.clone();
    let forward_task = tokio::spawn(async move {
        if !send_all(&mut sender, &baseline).await {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    trace!(kind = notification.kind(), "Forwarding to observer");
                    if !send(&mut sender, &ServerMessage::from(notification)).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Observer lagged, re-sending baseline");
                    let (fresh, baseline) = forward_hub.baseline();
                    rx = fresh;
                    if !send_all(&mut sender, &baseline).await {
                        break;
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Notification channel closed");
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            () = wait_stopped(&mut stopped) => {
                debug!("Hub stopping, closing observer");
                break;
            }
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => match ClientMessage::parse(text.as_str()) {
                    Some(message) => hub.apply(message),
                    None => trace!("Ignoring malformed observer message"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Observer closed connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(error = %err, "Observer socket error");
                    break;
                }
            },
        }
    }

    forward_task.abort();
    info!("Observer disconnected");
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for the health endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "ok" if responding.
    pub status: String,

    /// Connected observers.
    pub observers: usize,

    /// Buffered log records.
    pub logs: usize,

    /// Buffered network records.
    pub requests: usize,

    pub paused_logs: bool,

    pub paused_network: bool,

    pub uptime_seconds: u64,
}

async fn get_health(State(hub): State<BroadcastHub>) -> Json<HealthResponse> {
    let (logs, requests) = hub.collector.counts();
    let status = hub.collector.get_status();

    Json(HealthResponse {
        status: "ok".to_string(),
        observers: hub.observer_count(),
        logs,
        requests,
        paused_logs: status.paused_logs,
        paused_network: status.paused_network,
        uptime_seconds: hub.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
