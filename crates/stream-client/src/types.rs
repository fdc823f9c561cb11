//! Public types for the stream client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use agentdeck_protocol::constants::{WS_PING_PERIOD, WS_PONG_WAIT, WS_WRITE_WAIT};
use agentdeck_protocol::{DecodeError, Frame};

/// Connection state of a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Known scope (e.g. subscribed to) that was never connected.
    Idle,
    /// Transport open in progress.
    Connecting,
    /// Transport open; frames flow.
    Open,
    /// Transport close issued by the client.
    Closing,
    /// Transport gone.
    Closed(CloseReason),
    /// Waiting for the retry timer before the next connect attempt.
    Reconnecting { attempt: u32, delay: Duration },
}

impl ConnectionState {
    /// Whether the scope has, or is acquiring, a transport.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Connecting)
    }
}

/// Why a scope's transport closed.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// `disconnect` was called.
    Requested,
    /// Connection refused, handshake failure, abnormal closure, dead peer.
    Transport(String),
    /// No credential available, or the server rejected it.
    Unauthenticated,
}

/// A sequenced inbound message.
///
/// `sequence` is assigned by the client on receipt. It starts at 1 for a
/// scope and is never reset, not even across reconnects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub sequence: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    /// Sender timestamp, when the frame carried a parseable one.
    pub sent_at: Option<DateTime<Utc>>,
    /// Top-level frame fields other than `type`/`data`/`timestamp`.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub(crate) fn from_frame(sequence: u64, frame: Frame) -> Self {
        let sent_at = frame.sent_at();
        Self {
            sequence,
            kind: frame.kind,
            payload: frame.data,
            received_at: Utc::now(),
            sent_at,
            extra: frame.extra,
        }
    }
}

/// Notification delivered to the subscribers of a scope.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A decoded inbound frame.
    Envelope(Envelope),
    /// The scope changed state.
    StateChanged(ConnectionState),
    /// An inbound frame was dropped because it did not decode.
    DecodeError(DecodeError),
}

/// Outcome of a successful `send`.
#[derive(Debug, Clone, PartialEq)]
pub enum SendReceipt {
    /// Handed to the open transport.
    Sent,
    /// Queued until the scope is open again.
    Queued,
    /// Queued, but the queue was full and its oldest frame was dropped.
    Backpressured { dropped: Frame },
}

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Relative jitter applied to each delay (0.25 = ±25%).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    /// A fixed delay between attempts, without jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            jitter: 0.0,
        }
    }

    /// Calculates the delay for a given attempt number (1-based),
    /// with jitter to avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..1.0);
        let with_jitter = (capped + capped * self.jitter * offset).max(0.05);
        Duration::from_secs_f64(with_jitter)
    }
}

/// Keepalive timing for an open transport.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepaliveConfig {
    pub ping_period: Duration,
    /// Read deadline; reset by any inbound message.
    pub pong_wait: Duration,
    /// Longest a single write may take before the transport is dropped.
    pub write_wait: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_period: WS_PING_PERIOD,
            pong_wait: WS_PONG_WAIT,
            write_wait: WS_WRITE_WAIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_equality() {
        assert_eq!(ConnectionState::Open, ConnectionState::Open);
        assert_ne!(ConnectionState::Open, ConnectionState::Connecting);
        assert_ne!(
            ConnectionState::Closed(CloseReason::Requested),
            ConnectionState::Closed(CloseReason::Unauthenticated),
        );
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Idle.is_active());
    }

    #[test]
    fn reconnect_config_defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.backoff_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reconnect_config_delay_backoff() {
        let config = ReconnectConfig::default();
        // Base delays: 0.5s, 1s, 2s, 4s, 8s, 16s, 30s (capped), 30s...
        let expected_base = [0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 30.0, 30.0];
        for (i, &base) in expected_base.iter().enumerate() {
            let delay = config.delay_for_attempt((i + 1) as u32);
            let secs = delay.as_secs_f64();
            let lo = base * 0.74;
            let hi = base * 1.26;
            assert!(
                secs >= lo && secs <= hi,
                "attempt {}: {secs:.3}s not in [{lo:.3}, {hi:.3}]",
                i + 1
            );
        }
    }

    #[test]
    fn fixed_delay_has_no_jitter() {
        let config = ReconnectConfig::fixed(Duration::from_secs(5));
        for attempt in [1, 2, 10, 1000] {
            assert_eq!(config.delay_for_attempt(attempt), Duration::from_secs(5));
        }
    }

    #[test]
    fn envelope_keeps_frame_fields() {
        let frame = Frame::new("log", &serde_json::json!("a"))
            .unwrap()
            .with_field("agent_id", serde_json::json!("agent-42"));
        let env = Envelope::from_frame(7, frame);
        assert_eq!(env.sequence, 7);
        assert_eq!(env.kind, "log");
        assert_eq!(env.payload, "a");
        assert!(env.sent_at.is_some());
        assert_eq!(env.extra["agent_id"], "agent-42");
    }
}
