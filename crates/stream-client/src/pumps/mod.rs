//! Per-connection tasks: reading, writing and keepalive.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;

pub(crate) use ping::ping_pump;
pub(crate) use read::{CloseCause, Inbound, read_pump};
pub(crate) use write::write_pump;
