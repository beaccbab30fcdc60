//! Per-child forwarding proxy.
//!
//! A loopback-only WebSocket endpoint that one child process connects to.
//! The first frame must be an `auth` request carrying the proxy's one-time
//! token; after that, child frames go to the message handler and
//! [`ForwardingProxy::send_to_children`] fans frames back out.

pub mod connection;
mod session;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use botlink_settings::ProxySettings;

use crate::errors::ProxyError;
use connection::ChildConnection;

const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const MIN_TICK: Duration = Duration::from_millis(10);

/// Receives frames sent by authenticated children.
#[async_trait]
pub trait ChildFrameHandler: Send + Sync {
    /// Handle one frame from the child named `child`.
    async fn handle_child_frame(&self, child: &str, frame: String);
}

/// State shared between the proxy handle and its tasks.
pub(crate) struct ProxyShared {
    name: String,
    port: u16,
    token: String,
    settings: ProxySettings,
    connections: DashMap<Uuid, Arc<ChildConnection>>,
    handler: RwLock<Option<Arc<dyn ChildFrameHandler>>>,
    cancel: CancellationToken,
}

impl ProxyShared {
    async fn dispatch(&self, frame: String) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler.handle_child_frame(&self.name, frame).await,
            None => debug!(child = %self.name, "no message handler, dropping child frame"),
        }
    }
}

/// Loopback WebSocket proxy for a single child.
pub struct ForwardingProxy {
    shared: Arc<ProxyShared>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ForwardingProxy {
    /// Create a proxy for `name` on `port` expecting `token`.
    pub fn new(name: &str, port: u16, token: String, settings: ProxySettings) -> Self {
        Self {
            shared: Arc::new(ProxyShared {
                name: name.to_string(),
                port,
                token,
                settings,
                connections: DashMap::new(),
                handler: RwLock::new(None),
                cancel: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Number of authenticated child connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Install the handler for child frames.
    pub fn set_message_handler(&self, handler: Arc<dyn ChildFrameHandler>) {
        *self.shared.handler.write() = Some(handler);
    }

    /// Bind `127.0.0.1:port` and start accepting children.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let port = self.shared.port;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyStarted(port));
        }

        let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => listener,
            Err(source) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(ProxyError::Bind { port, source });
            }
        };

        let router = Router::new()
            .fallback(ws_handler)
            .with_state(Arc::clone(&self.shared));
        let shutdown = self.shared.cancel.clone();
        let name = self.shared.name.clone();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                warn!(child = %name, error = %e, "proxy server exited with error");
            }
        });
        let idle = tokio::spawn(run_idle_monitor(Arc::clone(&self.shared)));

        self.tasks.lock().extend([server, idle]);
        info!(child = %self.shared.name, port, "proxy listening");
        Ok(())
    }

    /// Broadcast a frame to every authenticated child.
    ///
    /// A connection whose queue is full or closed is dropped; the others
    /// still receive the frame. Returns how many connections accepted it.
    pub fn send_to_children(&self, frame: &str) -> usize {
        let frame = Arc::new(frame.to_string());
        let mut failed = Vec::new();
        let mut delivered = 0;
        for entry in &self.shared.connections {
            if entry.value().send(Arc::clone(&frame)) {
                delivered += 1;
            } else {
                failed.push(*entry.key());
            }
        }
        for id in failed {
            if let Some((_, conn)) = self.shared.connections.remove(&id) {
                warn!(child = %self.shared.name, conn_id = %id, "send failed, dropping child connection");
                conn.close();
            }
        }
        delivered
    }

    /// Stop accepting, close every child connection and wait for the tasks.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        for entry in &self.shared.connections {
            entry.value().close();
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        if tokio::time::timeout(STOP_TIMEOUT, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!(child = %self.shared.name, "proxy tasks did not stop in time");
        }
        self.shared.connections.clear();
        debug!(child = %self.shared.name, port = self.shared.port, "proxy stopped");
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(shared): State<Arc<ProxyShared>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::serve_child(socket, shared))
}

/// Close child connections that have been silent longer than the idle timeout.
async fn run_idle_monitor(shared: Arc<ProxyShared>) {
    let every = shared.settings.idle_check_interval().max(MIN_TICK);
    let idle_timeout = shared.settings.idle_timeout();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stale: Vec<Uuid> = shared
                    .connections
                    .iter()
                    .filter(|e| e.value().idle_for() > idle_timeout)
                    .map(|e| *e.key())
                    .collect();
                for id in stale {
                    if let Some((_, conn)) = shared.connections.remove(&id) {
                        warn!(child = %shared.name, conn_id = %id, "child idle too long, closing");
                        conn.close();
                    }
                }
            }
            () = shared.cancel.cancelled() => break,
        }
    }
}
