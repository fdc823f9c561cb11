fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use agentdeck_protocol::{DecodeError, EventKind, Frame};

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn read_fixture(name: &str) -> String {
        let path = fixtures_dir().join(name);
        fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    /// Decodes a fixture exactly as the stream client decodes a text frame.
    fn decode_fixture(name: &str) -> Frame {
        Frame::decode(&read_fixture(name))
            .unwrap_or_else(|e| panic!("failed to decode {name}: {e}"))
    }

    /// Decodes a fixture, re-encodes it, and compares the JSON values
    /// (order-independent).
    fn roundtrip_test(name: &str) {
        let fixture: serde_json::Value = serde_json::from_str(&read_fixture(name)).unwrap();
        let encoded = decode_fixture(name).encode().unwrap();
        let reencoded: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            fixture, reencoded,
            "roundtrip mismatch for {name}:\n  backend: {fixture}\n  rust:    {reencoded}"
        );
    }

    // --- Backend broadcast frames ---

    #[test]
    fn fixture_log_frame() {
        roundtrip_test("log_frame.json");

        let frame = decode_fixture("log_frame.json");
        assert_eq!(EventKind::from(frame.kind.as_str()), EventKind::Log);
        assert_eq!(frame.extra["agent_id"], "agent-42");
        assert_eq!(frame.data["message"], "Agent agent-42 started");
    }

    #[test]
    fn fixture_chat_frame() {
        roundtrip_test("chat_frame.json");

        let frame = decode_fixture("chat_frame.json");
        assert_eq!(EventKind::from(frame.kind.as_str()), EventKind::Chat);
        assert_eq!(frame.data["role"], "user");
    }

    #[test]
    fn fixture_typing_indicator_is_a_chat_frame() {
        let frame = decode_fixture("typing_frame.json");
        assert_eq!(frame.kind, "chat");
        assert_eq!(frame.data["type"], "typing");
        assert_eq!(frame.data["is_typing"], true);
    }

    #[test]
    fn fixture_agent_status_without_data() {
        let frame = decode_fixture("agent_status_frame.json");
        assert_eq!(EventKind::from(frame.kind.as_str()), EventKind::AgentStatus);
        assert!(frame.data.is_null(), "missing data should default to null");
        assert_eq!(frame.extra["status"], "running");
        assert_eq!(frame.extra["agent_id"], "agent-42");
    }

    // --- Timestamps ---

    #[test]
    fn backend_timestamps_parse_as_utc() {
        for name in [
            "log_frame.json",
            "chat_frame.json",
            "agent_status_frame.json",
            "typing_frame.json",
        ] {
            let frame = decode_fixture(name);
            let sent_at = frame
                .sent_at()
                .unwrap_or_else(|| panic!("{name}: timestamp {:?} did not parse", frame.timestamp));
            assert_eq!(sent_at.format("%Y-%m-%d").to_string(), "2024-05-01", "{name}");
        }
    }

    // --- Frames outside the stream contract ---

    #[test]
    fn reply_without_timestamp_is_rejected() {
        let err = Frame::decode(&read_fixture("message_sent_reply.json")).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)), "got {err:?}");
    }

    #[test]
    fn client_frames_match_backend_shape() {
        let frame = Frame::new("status", &serde_json::json!(null))
            .unwrap()
            .with_field("status", serde_json::json!("idle"));
        let value: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "idle");
        assert!(value["timestamp"].is_string());
        assert!(frame.sent_at().is_some());
    }
}
