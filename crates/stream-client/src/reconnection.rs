//! Connection driver: runs one attempt per generation and schedules the
//! next one with backoff when the transport goes away.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use agentdeck_protocol::constants::WS_WRITE_CHANNEL_CAPACITY;
use agentdeck_protocol::{DecodeError, Frame, Scope};

use crate::client::{Inner, lock};
use crate::error::TransportError;
use crate::pumps::{CloseCause, Inbound, ping_pump, read_pump, write_pump};
use crate::slot::{Attempt, ScopeSlot};
use crate::transport::Transport;
use crate::types::CloseReason;

/// Opens the transport for `attempt` and drives it until it closes.
///
/// Ends quietly when the attempt is cancelled (disconnect, shutdown or a
/// newer attempt); otherwise the loss is reported to the scope, which may
/// schedule a retry.
pub(crate) async fn run_attempt(inner: Arc<Inner>, scope: Scope, attempt: Attempt, token: String) {
    let Some(slot) = inner.slot(&scope) else {
        return;
    };

    let endpoint = match inner.config.endpoint(&scope) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(scope = %scope, "cannot resolve endpoint: {e}");
            let reason = CloseReason::Transport(e.to_string());
            handle_lost(&inner, &slot, &scope, attempt.generation, reason);
            return;
        }
    };

    debug!(scope = %scope, generation = attempt.generation, endpoint = %endpoint, "opening transport");
    let connected = tokio::select! {
        _ = attempt.cancel.cancelled() => {
            debug!(scope = %scope, generation = attempt.generation, "connect abandoned");
            return;
        }
        result = inner.connector.connect(&endpoint, &token) => result,
    };

    match connected {
        Ok(transport) => run_connection(&inner, &slot, &scope, &attempt, transport).await,
        Err(TransportError::Unauthorized) => {
            warn!(scope = %scope, "server rejected the credential");
            handle_lost(&inner, &slot, &scope, attempt.generation, CloseReason::Unauthenticated);
        }
        Err(e) => {
            warn!(scope = %scope, "connect failed: {e}");
            let reason = CloseReason::Transport(e.to_string());
            handle_lost(&inner, &slot, &scope, attempt.generation, reason);
        }
    }
}

/// Runs the pumps of an open transport until either side fails or the
/// attempt is cancelled.
async fn run_connection(
    inner: &Arc<Inner>,
    slot: &Arc<Mutex<ScopeSlot>>,
    scope: &Scope,
    attempt: &Attempt,
    transport: Transport,
) {
    let generation = attempt.generation;
    let capacity = inner.config.outbound_capacity.max(WS_WRITE_CHANNEL_CAPACITY);
    let (write_tx, write_rx) = mpsc::channel(capacity);

    if !lock(slot).opened(generation, write_tx.clone()) {
        return;
    }
    info!(scope = %scope, generation, "stream open");

    let conn_cancel = attempt.cancel.child_token();
    let keepalive = &inner.config.keepalive;
    let writer = tokio::spawn(write_pump(
        transport.sink,
        write_rx,
        keepalive.write_wait,
        conn_cancel.clone(),
    ));
    tokio::spawn(ping_pump(write_tx.clone(), keepalive.ping_period, conn_cancel.clone()));

    let cause = read_pump(
        transport.stream,
        write_tx,
        keepalive.pong_wait,
        conn_cancel.clone(),
        |inbound| {
            let decoded = match inbound {
                Inbound::Text(text) => Frame::decode(&text),
                Inbound::Binary(len) => Err(DecodeError::Binary { len }),
            };
            lock(slot).accept_frame(generation, decoded);
        },
    )
    .await;
    conn_cancel.cancel();

    if attempt.cancel.is_cancelled() {
        debug!(scope = %scope, generation, "stream closed locally");
        return;
    }
    // The connection token only fires without the attempt token when the
    // write pump gave up; its report is the real cause.
    let cause = match cause {
        CloseCause::Cancelled => match writer.await {
            Ok(Some(failure)) => failure,
            _ => CloseCause::Cancelled,
        },
        cause => cause,
    };
    info!(scope = %scope, generation, cause = %cause, "stream lost");
    handle_lost(inner, slot, scope, generation, CloseReason::Transport(cause.to_string()));
}

fn handle_lost(
    inner: &Arc<Inner>,
    slot: &Arc<Mutex<ScopeSlot>>,
    scope: &Scope,
    generation: u64,
    reason: CloseReason,
) {
    let retry = lock(slot).transport_lost(generation, reason, &inner.config.reconnect);
    if let Some(retry) = retry {
        info!(scope = %scope, delay_ms = retry.delay.as_millis() as u64, "reconnect scheduled");
        tokio::spawn(retry_after(inner.clone(), scope.clone(), retry.attempt, retry.delay));
    }
}

/// Waits out the backoff delay, then starts the next attempt.
///
/// Returns a boxed future to break the recursive type cycle with
/// `run_attempt`, which schedules this function after a loss.
fn retry_after(
    inner: Arc<Inner>,
    scope: Scope,
    attempt: Attempt,
    delay: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::select! {
            _ = attempt.cancel.cancelled() => {
                debug!(scope = %scope, "reconnect cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(slot) = inner.slot(&scope) else {
            return;
        };
        let Some(token) = inner.credentials.bearer_token() else {
            lock(&slot).credential_missing(attempt.generation);
            return;
        };
        let due = lock(&slot).retry_due(attempt.generation);
        if due {
            run_attempt(inner, scope, attempt, token).await;
        }
    })
}
