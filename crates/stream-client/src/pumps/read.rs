//! WebSocket read pump — hands inbound frames to the scope.

use std::fmt;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Raw inbound payload, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inbound {
    Text(String),
    Binary(usize),
}

/// Why a connection's pumps stopped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CloseCause {
    /// The peer sent a close frame.
    PeerClosed(Option<String>),
    /// The stream yielded an error.
    Error(String),
    /// The stream ended without a close frame.
    StreamEnded,
    /// Nothing arrived within the read deadline.
    DeadlineExpired,
    /// The connection token was cancelled.
    Cancelled,
    /// The write pump could not hand a message to the socket.
    WriteFailed(String),
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed(Some(reason)) => write!(f, "closed by peer: {reason}"),
            Self::PeerClosed(None) => f.write_str("closed by peer"),
            Self::Error(e) => write!(f, "read error: {e}"),
            Self::StreamEnded => f.write_str("stream ended"),
            Self::DeadlineExpired => f.write_str("read deadline expired"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::WriteFailed(e) => write!(f, "write failed: {e}"),
        }
    }
}

/// Reads messages until the transport goes away, passing text and binary
/// payloads to `on_inbound` in arrival order.
///
/// Any inbound message resets the read deadline; pings are answered with
/// pongs through `write_tx`.
pub(crate) async fn read_pump<S, F>(
    mut read: S,
    write_tx: mpsc::Sender<tungstenite::Message>,
    pong_wait: Duration,
    cancel: CancellationToken,
    mut on_inbound: F,
) -> CloseCause
where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    F: FnMut(Inbound),
{
    let deadline = tokio::time::sleep(pong_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return CloseCause::Cancelled,

            () = &mut deadline => {
                warn!(timeout_secs = pong_wait.as_secs_f64(), "read deadline expired, connection dead");
                return CloseCause::DeadlineExpired;
            }

            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        return CloseCause::Error(e.to_string());
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        return CloseCause::StreamEnded;
                    }
                };

                deadline.as_mut().reset(tokio::time::Instant::now() + pong_wait);

                match msg {
                    tungstenite::Message::Text(text) => {
                        on_inbound(Inbound::Text(text.to_string()));
                    }
                    tungstenite::Message::Binary(data) => {
                        on_inbound(Inbound::Binary(data.len()));
                    }
                    tungstenite::Message::Ping(data) => {
                        trace!("received ping, sending pong");
                        if write_tx.try_send(tungstenite::Message::Pong(data)).is_err() {
                            trace!("write channel unavailable, pong skipped");
                        }
                    }
                    tungstenite::Message::Pong(_) => trace!("received pong"),
                    tungstenite::Message::Close(frame) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                            .map(|s| s.trim().to_string());
                        debug!(reason = ?reason, "received close frame");
                        return CloseCause::PeerClosed(reason);
                    }
                    tungstenite::Message::Frame(_) => {}
                }
            }
        }
    }
}
