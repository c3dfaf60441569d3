//! Transport-agnostic relay engine: accept loop, dispatcher and per-session
//! byte splice with exactly-once teardown.

pub mod accept;
pub mod channel;
pub mod dispatch;
pub mod session;
