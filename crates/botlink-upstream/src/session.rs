//! Per-account socket loop over `tokio-tungstenite`.
//!
//! One task per account: connect, pump frames until the socket drops, back
//! off, repeat. Runs until the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use botlink_core::clock::unix_now;

use crate::account::AccountConnection;
use crate::errors::{Result, UpstreamError};
use crate::manager::{ConnectionManager, FrameHandler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames queued for an account's writer before `send` reports backpressure.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a connected session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    PeerClosed,
    ReadError,
    WriteError,
    Shutdown,
}

impl SessionEnd {
    fn as_str(self) -> &'static str {
        match self {
            Self::PeerClosed => "closed by peer",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Connect/reconnect loop for one account.
#[instrument(skip_all, fields(account_id = account.id()))]
pub(crate) async fn run_account_loop(
    manager: Arc<ConnectionManager>,
    account: Arc<AccountConnection>,
    handler: Arc<dyn FrameHandler>,
    cancel: CancellationToken,
) {
    let account_id = account.id();
    loop {
        let attempt = tokio::select! {
            res = open_socket(&account, manager.connect_timeout()) => res,
            () = cancel.cancelled() => break,
        };

        match attempt {
            Ok(ws) => {
                let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
                let was_silent = account.mark_connected(tx, unix_now());
                info!(
                    account_id,
                    endpoint = account.endpoint_uri(),
                    recovered = was_silent,
                    "upstream connected"
                );
                manager.claim_if_vacant(&account);

                let end = pump(&account, ws, rx, handler.as_ref(), &cancel).await;
                if end == SessionEnd::Shutdown {
                    account.close();
                    break;
                }
                warn!(account_id, reason = end.as_str(), "upstream connection lost");
            }
            Err(e) => {
                if !account.is_silent() {
                    warn!(account_id, endpoint = account.endpoint_uri(), error = %e, "upstream connect failed");
                }
            }
        }

        let (schedule, entered_silent) = account.mark_disconnected();
        if entered_silent {
            warn!(
                account_id,
                max_retries = account.policy().max_retries,
                delay_secs = schedule.delay.as_secs_f64(),
                "retry budget exhausted, continuing silently at max delay"
            );
        } else if !schedule.silent {
            debug!(account_id, delay_secs = schedule.delay.as_secs_f64(), "reconnecting after backoff");
        }

        tokio::select! {
            () = tokio::time::sleep(schedule.delay) => {}
            () = cancel.cancelled() => break,
        }
    }
    debug!(account_id, "account loop stopped");
}

async fn open_socket(account: &AccountConnection, timeout: Duration) -> Result<WsStream> {
    let mut request = account
        .endpoint_uri()
        .into_client_request()
        .map_err(|e| UpstreamError::InvalidEndpoint {
            uri: account.endpoint_uri().to_string(),
            message: e.to_string(),
        })?;

    if !account.auth_token().is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {}", account.auth_token())).map_err(
            |e| UpstreamError::InvalidEndpoint {
                uri: account.endpoint_uri().to_string(),
                message: format!("auth token is not a valid header value: {e}"),
            },
        )?;
        let _ = request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws, _) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| UpstreamError::ConnectTimeout(timeout))??;
    Ok(ws)
}

async fn pump(
    account: &Arc<AccountConnection>,
    ws: WsStream,
    mut outbound: mpsc::Receiver<String>,
    handler: &dyn FrameHandler,
    cancel: &CancellationToken,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handler.handle_frame(account, text.to_string()).await;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => handler.handle_frame(account, text).await,
                        Err(_) => debug!(account_id = account.id(), "dropping non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::PeerClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(account_id = account.id(), error = %e, "upstream read failed");
                        return SessionEnd::ReadError;
                    }
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else { return SessionEnd::WriteError };
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    debug!(account_id = account.id(), error = %e, "upstream write failed");
                    return SessionEnd::WriteError;
                }
            }
            () = cancel.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_TIMEOUT, ws_tx.send(Message::Close(None))).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}
