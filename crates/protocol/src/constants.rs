use std::fmt;
use std::time::Duration;

/// How often to send keepalive pings on an open stream.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Read deadline for an open stream.
///
/// Any inbound message (pong, push frame, ping) resets the deadline. If
/// nothing arrives within this window the connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(45);

/// Time allowed to hand one message to the socket.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Maximum accepted size of a single inbound frame (4 MB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Minimum capacity of the per-connection write channel.
pub const WS_WRITE_CHANNEL_CAPACITY: usize = 256;

/// Default number of envelopes retained per scope.
pub const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// Default number of outbound frames queued while a scope is not open.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 100;

/// Default path of the global event stream.
pub const DEFAULT_GLOBAL_PATH: &str = "/ws";

/// Default path of a per-agent event stream.
pub const DEFAULT_AGENT_PATH: &str = "/ws/agents/{agent_id}";

/// Placeholder substituted with the (percent-encoded) agent identifier.
pub const AGENT_ID_PLACEHOLDER: &str = "{agent_id}";

/// Well-known event kinds pushed by the backend.
///
/// The stream passes `type` through untouched; this is only a convenience
/// for consumers that want to match on the kinds the backend emits today.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Agent log line (`data` is the log record).
    Log,
    /// Chat turn (`data` is the chat message).
    Chat,
    /// Agent lifecycle status; the status string sits next to `data`.
    AgentStatus,
    /// Raw status report relayed from an agent.
    Status,
    /// Anything else.
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Log => "log",
            Self::Chat => "chat",
            Self::AgentStatus => "agent_status",
            Self::Status => "status",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for EventKind {
    fn from(kind: &str) -> Self {
        match kind {
            "log" => Self::Log,
            "chat" => Self::Chat,
            "agent_status" => Self::AgentStatus,
            "status" => Self::Status,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_map_both_ways() {
        for kind in ["log", "chat", "agent_status", "status"] {
            let parsed = EventKind::from(kind);
            assert!(!matches!(parsed, EventKind::Other(_)), "{kind}");
            assert_eq!(parsed.as_str(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let kind = EventKind::from("tool_call");
        assert_eq!(kind, EventKind::Other("tool_call".into()));
        assert_eq!(kind.to_string(), "tool_call");
    }

    #[test]
    fn keepalive_ping_fits_inside_read_deadline() {
        assert!(WS_PING_PERIOD < WS_PONG_WAIT);
    }
}
