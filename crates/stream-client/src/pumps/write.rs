//! WebSocket write pump: serialises outbound messages.

use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::read::CloseCause;

/// Writes queued messages to the sink until cancelled or the sink fails.
///
/// A failed or stalled write cancels `cancel`, which takes the read pump
/// (and with it the connection) down, and is returned as the close cause.
/// On a clean exit a close frame is sent.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    write_wait: Duration,
    cancel: CancellationToken,
) -> Option<CloseCause>
where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = write_rx.recv() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        let failure = match tokio::time::timeout(write_wait, write.send(msg)).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => {
                warn!("WebSocket write error: {e}");
                CloseCause::WriteFailed(e.to_string())
            }
            Err(_) => {
                warn!(timeout_secs = write_wait.as_secs_f64(), "WebSocket write stalled");
                CloseCause::WriteFailed(format!("write stalled for {write_wait:?}"))
            }
        };
        cancel.cancel();
        return Some(failure);
    }

    let close = tokio::time::timeout(write_wait, write.send(tungstenite::Message::Close(None)));
    if !matches!(close.await, Ok(Ok(()))) {
        debug!("close frame not delivered");
    }
    None
}
