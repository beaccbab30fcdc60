//! Authenticated child connection state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One authenticated child socket.
pub struct ChildConnection {
    /// Connection id (UUID v7).
    pub id: Uuid,
    tx: mpsc::Sender<Arc<String>>,
    last_activity: Mutex<Instant>,
    closed: CancellationToken,
}

impl ChildConnection {
    /// Wrap the sender feeding this socket's write half.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            tx,
            last_activity: Mutex::new(Instant::now()),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a frame. `false` if the queue is full, the socket is gone, or
    /// the connection has been closed.
    pub fn send(&self, frame: Arc<String>) -> bool {
        !self.is_closed() && self.tx.try_send(frame).is_ok()
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound text or binary frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Ask the socket task to close this connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
