//! Per-scope state machine.
//!
//! A [`ScopeSlot`] owns everything that belongs to one scope: connection
//! state, the current attempt's generation and cancellation token, the
//! envelope buffer, the outbound queue and the subscriber list. All methods
//! run under the scope's lock, so transitions of one scope never overlap.
//!
//! Every connect attempt (and the reconnect timer leading up to it) gets a
//! fresh generation. Events carry the generation of the attempt that
//! produced them; anything from an older generation is discarded.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use agentdeck_protocol::{DecodeError, Frame, Scope};

use crate::buffer::RingBuffer;
use crate::error::StreamError;
use crate::subscription::{Dispatch, Subscriber};
use crate::types::{
    CloseReason, ConnectionState, Envelope, ReconnectConfig, SendReceipt, StreamEvent,
};

/// Handle of a started attempt.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub(crate) generation: u64,
    pub(crate) cancel: CancellationToken,
}

/// A reconnect scheduled after a transport loss.
#[derive(Debug, Clone)]
pub(crate) struct Retry {
    pub(crate) attempt: Attempt,
    pub(crate) delay: Duration,
}

pub(crate) struct ScopeSlot {
    scope: Scope,
    state: ConnectionState,
    wants_open: bool,
    ever_connected: bool,
    generation: u64,
    attempt_cancel: Option<CancellationToken>,
    reconnect_attempt: u32,
    next_sequence: u64,
    buffer: RingBuffer<Envelope>,
    outbound: RingBuffer<Frame>,
    writer: Option<mpsc::Sender<tungstenite::Message>>,
    subscribers: Vec<Subscriber>,
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
}

impl ScopeSlot {
    pub(crate) fn new(
        scope: Scope,
        buffer_capacity: usize,
        outbound_capacity: usize,
        dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    ) -> Self {
        Self {
            scope,
            state: ConnectionState::Idle,
            wants_open: false,
            ever_connected: false,
            generation: 0,
            attempt_cancel: None,
            reconnect_attempt: 0,
            next_sequence: 1,
            buffer: RingBuffer::new(buffer_capacity),
            outbound: RingBuffer::new(outbound_capacity),
            writer: None,
            subscribers: Vec::new(),
            dispatch_tx,
        }
    }

    pub(crate) fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub(crate) fn snapshot(&self) -> Vec<Envelope> {
        self.buffer.snapshot()
    }

    pub(crate) fn queued_outbound(&self) -> usize {
        self.outbound.len()
    }

    // -- subscribers ------------------------------------------------------

    pub(crate) fn add_subscriber(&mut self, subscriber: Subscriber) {
        self.subscribers.push(subscriber);
    }

    pub(crate) fn remove_subscriber(&mut self, id: u64) {
        self.subscribers.retain(|s| {
            if s.id == id {
                s.deactivate();
                false
            } else {
                true
            }
        });
    }

    fn notify(&self, event: StreamEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        let dispatch = Dispatch {
            event,
            targets: self.subscribers.clone(),
        };
        if self.dispatch_tx.send(dispatch).is_err() {
            trace!(scope = %self.scope, "dispatcher gone, notification dropped");
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(scope = %self.scope, generation = self.generation, from = ?self.state, to = ?state, "stream state changed");
        self.state = state.clone();
        self.notify(StreamEvent::StateChanged(state));
    }

    // -- lifecycle --------------------------------------------------------

    /// Supersedes the current attempt: cancels its token and bumps the
    /// generation so late events from it are ignored.
    fn begin_attempt(&mut self) -> Attempt {
        if let Some(old) = self.attempt_cancel.take() {
            old.cancel();
        }
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.attempt_cancel = Some(cancel.clone());
        Attempt {
            generation: self.generation,
            cancel,
        }
    }

    /// Handles `connect`. Returns the attempt to run, or `None` when the
    /// scope is already open or connecting.
    pub(crate) fn request_connect(&mut self) -> Option<Attempt> {
        if self.state.is_active() {
            return None;
        }
        self.wants_open = true;
        self.ever_connected = true;
        let attempt = self.begin_attempt();
        self.transition(ConnectionState::Connecting);
        Some(attempt)
    }

    /// Transport of `generation` opened. Flushes the outbound queue into
    /// `writer` before anything else can be sent. Returns `false` when the
    /// attempt was superseded; the caller then drops the transport.
    pub(crate) fn opened(
        &mut self,
        generation: u64,
        writer: mpsc::Sender<tungstenite::Message>,
    ) -> bool {
        if !self.is_current(generation) || !self.wants_open {
            debug!(scope = %self.scope, generation, current = self.generation, "discarding open from superseded attempt");
            return false;
        }

        if !self.outbound.is_empty() {
            debug!(scope = %self.scope, queued = self.outbound.len(), "flushing outbound queue");
        }
        for frame in self.outbound.drain() {
            let text = match frame.encode() {
                Ok(t) => t,
                Err(e) => {
                    warn!(scope = %self.scope, "dropping unencodable queued frame: {e}");
                    continue;
                }
            };
            if writer.try_send(tungstenite::Message::Text(text.into())).is_err() {
                warn!(scope = %self.scope, "write channel rejected queued frame");
            }
        }

        self.writer = Some(writer);
        self.reconnect_attempt = 0;
        self.transition(ConnectionState::Open);
        true
    }

    /// Sequences a decoded frame (or reports a decode failure) from the
    /// transport of `generation`. Returns `false` for stale events.
    pub(crate) fn accept_frame(
        &mut self,
        generation: u64,
        decoded: Result<Frame, DecodeError>,
    ) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Open {
            trace!(scope = %self.scope, generation, "discarding frame from superseded attempt");
            return false;
        }
        match decoded {
            Ok(frame) => {
                let envelope = Envelope::from_frame(self.next_sequence, frame);
                self.next_sequence += 1;
                trace!(scope = %self.scope, sequence = envelope.sequence, kind = %envelope.kind, "envelope received");
                self.buffer.push(envelope.clone());
                self.notify(StreamEvent::Envelope(envelope));
            }
            Err(e) => {
                warn!(scope = %self.scope, "dropping inbound frame: {e}");
                self.notify(StreamEvent::DecodeError(e));
            }
        }
        true
    }

    /// Transport of `generation` failed to open or closed. Schedules a
    /// reconnect unless the loss is stale, the scope no longer wants to be
    /// open, or the server rejected the credential.
    pub(crate) fn transport_lost(
        &mut self,
        generation: u64,
        reason: CloseReason,
        policy: &ReconnectConfig,
    ) -> Option<Retry> {
        if !self.is_current(generation) || !self.wants_open {
            debug!(scope = %self.scope, generation, current = self.generation, "discarding close from superseded attempt");
            return None;
        }

        self.writer = None;
        if reason == CloseReason::Unauthenticated {
            self.stop(CloseReason::Unauthenticated);
            return None;
        }

        self.transition(ConnectionState::Closed(reason));
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let delay = policy.delay_for_attempt(self.reconnect_attempt);
        let attempt = self.begin_attempt();
        self.transition(ConnectionState::Reconnecting {
            attempt: self.reconnect_attempt,
            delay,
        });
        Some(Retry { attempt, delay })
    }

    /// Reconnect timer of `generation` fired. Returns `true` when the retry
    /// should go ahead.
    pub(crate) fn retry_due(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || !self.wants_open {
            return false;
        }
        self.transition(ConnectionState::Connecting);
        true
    }

    /// No credential was available when a retry was due.
    pub(crate) fn credential_missing(&mut self, generation: u64) {
        if self.is_current(generation) {
            warn!(scope = %self.scope, "no credential available, giving up reconnect");
            self.stop(CloseReason::Unauthenticated);
        }
    }

    /// Handles `disconnect`: cancels the attempt (reconnect timer, pending
    /// open or live pumps) and closes the scope. The buffer is discarded;
    /// the outbound queue and subscribers stay.
    pub(crate) fn disconnect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Closed(CloseReason::Requested)
        ) && !self.wants_open
        {
            return;
        }
        if self.writer.is_some() {
            self.transition(ConnectionState::Closing);
        }
        self.stop(CloseReason::Requested);
        self.buffer.clear();
    }

    fn stop(&mut self, reason: CloseReason) {
        self.wants_open = false;
        if let Some(cancel) = self.attempt_cancel.take() {
            cancel.cancel();
        }
        self.generation += 1;
        self.writer = None;
        self.reconnect_attempt = 0;
        self.transition(ConnectionState::Closed(reason));
    }

    // -- send path --------------------------------------------------------

    pub(crate) fn send(&mut self, frame: Frame) -> Result<SendReceipt, StreamError> {
        if !self.ever_connected {
            return Err(StreamError::UnconnectedScope(self.scope.clone()));
        }

        if self.state == ConnectionState::Open
            && let Some(writer) = &self.writer
        {
            let text = frame.encode()?;
            match writer.try_send(tungstenite::Message::Text(text.into())) {
                Ok(()) => return Ok(SendReceipt::Sent),
                Err(TrySendError::Full(_)) => {
                    return Err(StreamError::Backpressure(self.scope.clone()));
                }
                // Writer already gone; the close event is on its way.
                Err(TrySendError::Closed(_)) => {}
            }
        }

        match self.outbound.push(frame) {
            None => Ok(SendReceipt::Queued),
            Some(dropped) => {
                warn!(
                    scope = %self.scope,
                    capacity = self.outbound.capacity(),
                    "outbound queue full, dropped oldest frame"
                );
                Ok(SendReceipt::Backpressured { dropped })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(capacity: usize) -> (ScopeSlot, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = ScopeSlot::new(Scope::agent("agent-42"), capacity, 2, tx);
        slot.add_subscriber(Subscriber::new(1, std::sync::Arc::new(|_: &StreamEvent| {})));
        (slot, rx)
    }

    fn log_frame(data: &str) -> Result<Frame, DecodeError> {
        Ok(Frame::new("log", &data).unwrap())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Dispatch>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(d) = rx.try_recv() {
            events.push(d.event);
        }
        events
    }

    fn open(slot: &mut ScopeSlot) -> (Attempt, mpsc::Receiver<tungstenite::Message>) {
        let attempt = slot.request_connect().unwrap();
        let (tx, rx) = mpsc::channel(16);
        assert!(slot.opened(attempt.generation, tx));
        (attempt, rx)
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let (mut slot, _rx) = slot(10);
        let attempt = slot.request_connect().unwrap();
        assert_eq!(slot.state(), &ConnectionState::Connecting);
        assert!(slot.request_connect().is_none());

        let (tx, _wrx) = mpsc::channel(16);
        slot.opened(attempt.generation, tx);
        assert!(slot.request_connect().is_none());
        assert!(!attempt.cancel.is_cancelled());
    }

    #[test]
    fn sequences_start_at_one_and_increase() {
        let (mut slot, mut rx) = slot(10);
        let (attempt, _w) = open(&mut slot);
        drain(&mut rx);

        slot.accept_frame(attempt.generation, log_frame("a"));
        slot.accept_frame(attempt.generation, log_frame("b"));

        let events = drain(&mut rx);
        let seqs: Vec<(u64, String)> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Envelope(env) => Some((env.sequence, env.kind.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![(1, "log".into()), (2, "log".into())]);
    }

    #[test]
    fn capacity_two_keeps_last_two() {
        let (mut slot, _rx) = slot(2);
        let (attempt, _w) = open(&mut slot);
        for data in ["a", "b", "c"] {
            slot.accept_frame(attempt.generation, log_frame(data));
        }
        let payloads: Vec<_> = slot.snapshot().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["b", "c"]);
    }

    #[test]
    fn decode_error_is_reported_and_not_sequenced() {
        let (mut slot, mut rx) = slot(10);
        let (attempt, _w) = open(&mut slot);
        drain(&mut rx);

        slot.accept_frame(attempt.generation, Err(DecodeError::Binary { len: 3 }));
        slot.accept_frame(attempt.generation, log_frame("ok"));

        let events = drain(&mut rx);
        assert!(matches!(events[0], StreamEvent::DecodeError(DecodeError::Binary { len: 3 })));
        assert!(matches!(&events[1], StreamEvent::Envelope(e) if e.sequence == 1));
        assert_eq!(slot.state(), &ConnectionState::Open);
    }

    #[test]
    fn loss_schedules_retry_and_keeps_buffer() {
        let (mut slot, mut rx) = slot(10);
        let (attempt, _w) = open(&mut slot);
        slot.accept_frame(attempt.generation, log_frame("kept"));
        drain(&mut rx);

        let retry = slot
            .transport_lost(
                attempt.generation,
                CloseReason::Transport("reset".into()),
                &ReconnectConfig::fixed(Duration::from_secs(5)),
            )
            .unwrap();
        assert!(attempt.cancel.is_cancelled());
        assert_eq!(retry.delay, Duration::from_secs(5));
        assert_eq!(
            slot.state(),
            &ConnectionState::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            StreamEvent::StateChanged(ConnectionState::Closed(CloseReason::Transport(
                "reset".into()
            )))
        );
        assert_eq!(slot.snapshot().len(), 1);

        assert!(slot.retry_due(retry.attempt.generation));
        let (tx, _w2) = mpsc::channel(16);
        assert!(slot.opened(retry.attempt.generation, tx));
        slot.accept_frame(retry.attempt.generation, log_frame("after"));
        let seqs: Vec<u64> = slot.snapshot().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn events_after_disconnect_are_discarded() {
        let (mut slot, mut rx) = slot(10);
        let attempt = slot.request_connect().unwrap();
        slot.disconnect();
        assert!(attempt.cancel.is_cancelled());
        drain(&mut rx);

        let (tx, _w) = mpsc::channel(16);
        assert!(!slot.opened(attempt.generation, tx));
        assert!(!slot.accept_frame(attempt.generation, log_frame("late")));
        assert!(
            slot.transport_lost(
                attempt.generation,
                CloseReason::Transport("late".into()),
                &ReconnectConfig::default()
            )
            .is_none()
        );

        assert_eq!(
            slot.state(),
            &ConnectionState::Closed(CloseReason::Requested)
        );
        assert!(slot.snapshot().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn retry_timer_after_disconnect_does_nothing() {
        let (mut slot, _rx) = slot(10);
        let (attempt, _w) = open(&mut slot);
        let retry = slot
            .transport_lost(
                attempt.generation,
                CloseReason::Transport("x".into()),
                &ReconnectConfig::default(),
            )
            .unwrap();
        slot.disconnect();
        assert!(retry.attempt.cancel.is_cancelled());
        assert!(!slot.retry_due(retry.attempt.generation));
        assert_eq!(
            slot.state(),
            &ConnectionState::Closed(CloseReason::Requested)
        );
    }

    #[test]
    fn disconnect_from_open_passes_through_closing() {
        let (mut slot, mut rx) = slot(10);
        open(&mut slot);
        drain(&mut rx);
        slot.disconnect();
        assert_eq!(
            drain(&mut rx),
            vec![
                StreamEvent::StateChanged(ConnectionState::Closing),
                StreamEvent::StateChanged(ConnectionState::Closed(CloseReason::Requested)),
            ]
        );
        slot.disconnect();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn server_rejection_stops_retrying() {
        let (mut slot, _rx) = slot(10);
        let attempt = slot.request_connect().unwrap();
        let retry = slot.transport_lost(
            attempt.generation,
            CloseReason::Unauthenticated,
            &ReconnectConfig::default(),
        );
        assert!(retry.is_none());
        assert_eq!(
            slot.state(),
            &ConnectionState::Closed(CloseReason::Unauthenticated)
        );
        assert!(slot.request_connect().is_some());
    }

    #[test]
    fn send_on_never_connected_scope_fails() {
        let (mut slot, _rx) = slot(10);
        let frame = Frame::new("chat", &"hi").unwrap();
        assert!(matches!(
            slot.send(frame),
            Err(StreamError::UnconnectedScope(_))
        ));
    }

    #[test]
    fn queued_sends_flush_in_order_before_new_ones() {
        let (mut slot, _rx) = slot(10);
        let attempt = slot.request_connect().unwrap();

        for text in ["q1", "q2", "q3"] {
            slot.send(Frame::new("chat", &text).unwrap()).unwrap();
        }
        // Capacity 2: q1 was dropped when q3 arrived.
        assert_eq!(slot.queued_outbound(), 2);

        let (tx, mut wrx) = mpsc::channel(16);
        slot.opened(attempt.generation, tx);
        assert_eq!(
            slot.send(Frame::new("chat", &"live").unwrap()).unwrap(),
            SendReceipt::Sent
        );

        let mut sent = Vec::new();
        while let Ok(tungstenite::Message::Text(t)) = wrx.try_recv() {
            sent.push(Frame::decode(t.as_str()).unwrap().data);
        }
        assert_eq!(sent, vec!["q2", "q3", "live"]);
    }

    #[test]
    fn full_queue_reports_dropped_frame() {
        let (mut slot, _rx) = slot(10);
        slot.request_connect().unwrap();
        assert_eq!(
            slot.send(Frame::new("chat", &"1").unwrap()).unwrap(),
            SendReceipt::Queued
        );
        slot.send(Frame::new("chat", &"2").unwrap()).unwrap();
        match slot.send(Frame::new("chat", &"3").unwrap()).unwrap() {
            SendReceipt::Backpressured { dropped } => assert_eq!(dropped.data, "1"),
            other => panic!("expected backpressure, got {other:?}"),
        }
    }

    #[test]
    fn saturated_writer_is_backpressure() {
        let (mut slot, _rx) = slot(10);
        let attempt = slot.request_connect().unwrap();
        let (tx, _wrx) = mpsc::channel(1);
        slot.opened(attempt.generation, tx);

        assert_eq!(
            slot.send(Frame::new("chat", &"a").unwrap()).unwrap(),
            SendReceipt::Sent
        );
        assert!(matches!(
            slot.send(Frame::new("chat", &"b").unwrap()),
            Err(StreamError::Backpressure(_))
        ));
    }
}
