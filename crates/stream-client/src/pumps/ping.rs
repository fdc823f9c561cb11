//! WebSocket ping pump: periodic keepalive pings.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Queues a ping every `period` until cancelled or the writer is gone.
///
/// Pings are skipped, not queued behind, when the write channel is full;
/// a saturated writer is already proof of a live connection.
pub(crate) async fn ping_pump(
    write_tx: mpsc::Sender<tungstenite::Message>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match write_tx.try_send(tungstenite::Message::Ping(Vec::new().into())) {
                    Ok(()) => trace!("ping queued"),
                    Err(mpsc::error::TrySendError::Full(_)) => trace!("write channel full, ping skipped"),
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_pump_stops_on_cancel() {
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(5), cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }

    #[tokio::test(start_paused = true)]
    async fn pings_every_period() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(tx, Duration::from_secs(5), cancel.clone()));

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            let msg = rx.recv().await.unwrap();
            assert!(matches!(msg, tungstenite::Message::Ping(_)));
        }
        assert!(started.elapsed() >= Duration::from_secs(15));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_writer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        tokio::time::timeout(
            Duration::from_secs(2),
            ping_pump(tx, Duration::from_millis(10), CancellationToken::new()),
        )
        .await
        .expect("should stop once the channel is closed");
    }
}
