//! Per-process terminal sessions over reconnecting transports.
//!
//! Provides:
//! - `SessionRegistry` - One session per remote process, created and closed
//!   from process lifecycle signals
//! - `Session` - Tail buffer, flow-controlled writer and line discipline
//!   around one transport
//! - `OutputSink` - Where rendered output goes
//! - Crossterm key mapping (feature: tui)

pub mod discipline;
pub mod flow;
#[cfg(feature = "tui")]
pub mod keys;
pub mod registry;
pub mod session;
pub mod sink;

pub use discipline::{Action, DisciplineMode, LineDiscipline};
pub use flow::{FlowThresholds, FlowWriter, WriteCompletion};
pub use registry::{SessionRegistry, SinkFactory};
pub use session::{LineEndings, Session, SessionConfig, SessionError, SessionKey, SessionStats};
pub use sink::{ChannelSink, Notice, NullSink, OutputSink, SinkEvent};
