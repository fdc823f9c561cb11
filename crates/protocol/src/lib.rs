//! Wire protocol types for the agentdeck event stream.
//!
//! Frames are JSON objects of the shape `{type, data, timestamp}` exchanged
//! over a WebSocket per [`Scope`].

pub mod constants;
pub mod frame;
pub mod scope;

pub use constants::EventKind;
pub use frame::{DecodeError, Frame};
pub use scope::{Scope, ScopeParseError};
