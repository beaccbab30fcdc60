//! Per-socket handling: auth handshake, then relay with transport pings.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep_until};
use tracing::{debug, info, instrument, warn};

use botlink_core::protocol::{RETCODE_UNAUTHORIZED, WireRequest, WireResponse};

use super::ProxyShared;
use super::connection::ChildConnection;

const SEND_QUEUE_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outcome of the auth handshake.
#[derive(Debug, PartialEq)]
pub(crate) enum AuthOutcome {
    /// Token matched; reply `ok` with this echo.
    Accepted(Value),
    /// Anything else; reply 401 with this echo.
    Rejected(Value),
}

/// Judge the first frame of a connection against the expected token.
pub(crate) fn authenticate(frame: &str, expected_token: &str) -> AuthOutcome {
    match WireRequest::parse(frame) {
        Ok(request) => {
            if request.access_token() == Some(expected_token) {
                AuthOutcome::Accepted(request.echo)
            } else {
                AuthOutcome::Rejected(request.echo)
            }
        }
        Err(_) => AuthOutcome::Rejected(Value::Null),
    }
}

/// Drive one child socket until it closes, times out, or the proxy stops.
#[instrument(skip_all, fields(child = %shared.name, port = shared.port))]
pub(crate) async fn serve_child(socket: WebSocket, shared: Arc<ProxyShared>) {
    let (mut sink, mut stream) = socket.split();

    let first = tokio::select! {
        first = tokio::time::timeout(shared.settings.auth_timeout(), next_text(&mut stream)) => first,
        () = shared.cancel.cancelled() => return,
    };
    let frame = match first {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("child disconnected before auth");
            return;
        }
        Err(_) => {
            warn!("child did not authenticate in time");
            close(&mut sink).await;
            return;
        }
    };

    match authenticate(&frame, &shared.token) {
        AuthOutcome::Accepted(echo) => {
            if sink.send(text(WireResponse::ok(echo).to_frame())).await.is_err() {
                return;
            }
        }
        AuthOutcome::Rejected(echo) => {
            warn!("child auth rejected");
            let reply = WireResponse::failed(RETCODE_UNAUTHORIZED, echo).to_frame();
            let _ = sink.send(text(reply)).await;
            close(&mut sink).await;
            return;
        }
    }

    let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let conn = Arc::new(ChildConnection::new(tx));
    let _ = shared.connections.insert(conn.id, Arc::clone(&conn));
    info!(conn_id = %conn.id, "child authenticated");

    relay(&shared, &conn, sink, stream, rx).await;

    let _ = shared.connections.remove(&conn.id);
    info!(conn_id = %conn.id, "child disconnected");
}

async fn relay(
    shared: &ProxyShared,
    conn: &ChildConnection,
    mut sink: SplitSink<WebSocket, Message>,
    mut stream: SplitStream<WebSocket>,
    mut rx: mpsc::Receiver<Arc<String>>,
) {
    let ping_every = shared.settings.ping_interval().max(Duration::from_millis(10));
    let pong_timeout = shared.settings.pong_timeout();
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(t))) => {
                    conn.touch();
                    shared.dispatch(t.to_string()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    conn.touch();
                    match String::from_utf8(data.to_vec()) {
                        Ok(t) => shared.dispatch(t).await,
                        Err(_) => debug!(conn_id = %conn.id, "dropping non-utf8 frame"),
                    }
                }
                // Transport keepalive only; idle time counts application frames.
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "child read failed");
                    break;
                }
            },
            out = rx.recv() => {
                let Some(frame) = out else { break };
                if sink.send(text(frame.as_str().to_owned())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + pong_timeout);
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            () = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                warn!(conn_id = %conn.id, "pong timeout, closing child connection");
                break;
            }
            () = conn.closed() => break,
            () = shared.cancel.cancelled() => break,
        }
    }

    close(&mut sink).await;
}

async fn next_text(stream: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(t)) => return Some(t.to_string()),
            Ok(Message::Binary(data)) => return Some(String::from_utf8_lossy(&data).into_owned()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

async fn close(sink: &mut SplitSink<WebSocket, Message>) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
}

fn text(frame: String) -> Message {
    Message::Text(frame.into())
}
