//! Broadcast of connection state transitions.

use futures::{StreamExt, stream::BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Attempts exhausted; only an explicit `connect()` leaves this state.
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Fan-out of state transitions to any number of observers.
///
/// Observers that fall behind lose the oldest transitions, never the
/// transport's own progress.
#[derive(Debug)]
pub struct StatusBus {
    sender: broadcast::Sender<ConnectionState>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    /// Publish one transition.
    pub fn publish(&self, state: ConnectionState) {
        let _ = self.sender.send(state); // no observers is fine
    }

    /// Receiver for transitions published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.sender.subscribe()
    }

    /// Stream that yields `current` first, then live transitions.
    #[must_use]
    pub fn current_plus_stream(&self, current: ConnectionState) -> BoxStream<'static, ConnectionState> {
        let live = BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() });
        futures::stream::once(async move { current }).chain(live).boxed()
    }
}
