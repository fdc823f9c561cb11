use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::MAX_FRAME_SIZE;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(String),

    #[error("frame too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("unexpected binary frame ({len} bytes)")]
    Binary { len: usize },
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Top-level keys owned by [`Frame`]'s own fields.
const RESERVED_KEYS: [&str; 3] = ["type", "data", "timestamp"];

/// A single message on the event stream, in either direction.
///
/// `data` is opaque to the stream and defaults to `null` when absent.
/// Top-level fields other than `type`/`data`/`timestamp` (the backend sets
/// `agent_id` and, for status changes, `status`) are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Frame {
    /// Creates a frame stamped with the current time.
    pub fn new<T: Serialize>(kind: impl Into<String>, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.into(),
            data: serde_json::to_value(data)?,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            extra: serde_json::Map::new(),
        })
    }

    /// Adds a top-level field next to `data`.
    ///
    /// `type`, `data` and `timestamp` belong to the frame itself; setting
    /// one of them here is ignored so the encoded object never repeats a key.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let key = key.into();
        if !RESERVED_KEYS.contains(&key.as_str()) {
            self.extra.insert(key, value);
        }
        self
    }

    /// Decodes a text frame, rejecting anything above [`MAX_FRAME_SIZE`].
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(DecodeError::TooLarge {
                size: text.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the frame for the wire.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The sender's timestamp, if it parses.
    ///
    /// Accepts RFC 3339 as well as offset-less ISO-8601 (which the Python
    /// backend emits); the latter is taken as UTC.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}
