//! Core building blocks for terminal session streaming.
//!
//! This crate provides:
//! - `Envelope` / `Outbound` - The wire message shape and its JSON codec
//! - Typed payloads for each message category
//! - `Dispatcher` - Per-category routing of inbound envelopes
//! - `TailBuffer` - Bounded recent-output store
//! - `ClientContext` - Handshake identity

pub mod context;
pub mod dispatch;
pub mod envelope;
pub mod payload;
pub mod tail;

pub use context::{ClientContext, WorkspaceInfo, WorkspaceKind};
pub use dispatch::{Dispatcher, Handler, HandlerError, Outcome};
pub use envelope::{Category, CodecError, Envelope, MessageType, Outbound};
pub use payload::{FlowControl, TerminalEvent, TerminalMessage};
pub use tail::{BufferStats, TailBuffer};
