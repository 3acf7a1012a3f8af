//! Session-based command execution: spawn behind the command gate, collect
//! output per session, race completion against a per-call timeout, and stop
//! sessions with escalating signals.

pub mod buffer;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod session;
pub mod termination;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
