//! Session protocol client for the conversational-AI gateway.
//!
//! The gateway speaks a JSON frame protocol over a single WebSocket:
//! correlated request/response pairs multiplexed with server-pushed events.
//! This crate owns the hard parts of being its client: the challenge/response
//! handshake, request correlation with per-request deadlines, aggregation of
//! streamed chat output into whole turns, and transparent reconnection with
//! bounded backoff.
//!
//! - `protocol`: typed wire frames, decoded once at the boundary.
//! - `transport`: the duplex channel behind an injectable seam.
//! - `session`: the client itself, all state confined to one actor task.

pub mod protocol;
pub mod session;
pub mod transport;

pub use protocol::Attachment;
pub use session::{SessionClient, SessionConfig, SessionState};
