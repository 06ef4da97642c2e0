//! Where session output ends up: a renderer, a test channel, or nowhere.

use std::time::Duration;

use termstream_transport::ConnectionState;
use tokio::sync::mpsc;

use crate::flow::WriteCompletion;

/// Out-of-band information for whoever renders the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The remote end reported an error.
    RemoteError(String),
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed { attempts: u32 },
}

/// Consumer of a session's output.
///
/// `write` receives paced output. Drop or complete `done` once the chunk
/// has been consumed; holding on to it applies backpressure.
pub trait OutputSink: Send + 'static {
    fn write(&mut self, data: &str, done: WriteCompletion);

    /// Connection state or paused flag changed.
    fn status(&mut self, _state: ConnectionState, _paused: bool) {}

    fn notice(&mut self, _notice: Notice) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&mut self, _data: &str, done: WriteCompletion) {
        done.complete();
    }
}

/// What a [`ChannelSink`] forwards.
#[derive(Debug)]
pub enum SinkEvent {
    Output { data: String, done: WriteCompletion },
    Status { state: ConnectionState, paused: bool },
    Notice(Notice),
}

/// Forwards everything to a channel, completion tokens included.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn write(&mut self, data: &str, done: WriteCompletion) {
        // A closed receiver drops `done`, which completes it.
        let _ = self.tx.send(SinkEvent::Output {
            data: data.to_string(),
            done,
        });
    }

    fn status(&mut self, state: ConnectionState, paused: bool) {
        let _ = self.tx.send(SinkEvent::Status { state, paused });
    }

    fn notice(&mut self, notice: Notice) {
        let _ = self.tx.send(SinkEvent::Notice(notice));
    }
}
