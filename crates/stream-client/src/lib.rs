//! Streaming client for the agentdeck event channel.
//!
//! Keeps one WebSocket per [`Scope`] (global or per-agent), reconnects with
//! exponential backoff, sequences inbound frames into a bounded per-scope
//! buffer and fans them out to subscribers.

pub mod buffer;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
mod pumps;
mod reconnection;
mod slot;
pub mod subscription;
pub mod transport;
pub mod types;

pub use agentdeck_protocol::{EventKind, Frame, Scope};
pub use buffer::RingBuffer;
pub use client::StreamClient;
pub use config::{ConfigError, StreamConfig};
pub use credentials::{CredentialProvider, StaticToken, TokenStore};
pub use error::{StreamError, TransportError};
pub use subscription::Subscription;
pub use transport::{Connector, Transport, WsConnector};
pub use types::{
    CloseReason, ConnectionState, Envelope, KeepaliveConfig, ReconnectConfig, SendReceipt,
    StreamEvent,
};
