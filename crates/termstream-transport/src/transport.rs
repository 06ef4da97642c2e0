//! Reconnecting transport.
//!
//! A [`Transport`] is a cheap, cloneable handle. The connection itself is
//! owned by a driver task, which is the only place state transitions happen:
//!
//! ```text
//! disconnected --connect--> connecting --open--> connected
//!      ^                      |    ^                 |
//!      |                 fail |    | delay     close |
//!      |                      v    |                 v
//!      +---disconnect---- reconnecting <-------------+
//!                             |
//!                   exhausted v
//!                          failed --connect--> connecting
//! ```
//!
//! Writes made while the connection is not open are queued and flushed in
//! order, right after the optional handshake, as soon as it opens.

use std::{
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt, future::BoxFuture, stream::BoxStream};
use serde::Deserialize;
use termstream_core::{Category, ClientContext, Envelope, Outbound};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    time::Sleep,
};

use crate::{
    connector::{Connection, Connector},
    policy::ReconnectPolicy,
    queue::{DEFAULT_QUEUE_CAPACITY, OutboundQueue},
    status::{ConnectionState, StatusBus},
};

/// Grace period for the close handshake on disconnect.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Outbound queue full ({capacity} messages)")]
    QueueOverflow { capacity: usize },
    #[error("Transport closed")]
    Closed,
}

/// Something the owner of a transport should know about, in order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The state changed. Fired once per transition.
    State(ConnectionState),
    /// A decoded inbound envelope.
    Envelope(Envelope),
    /// A retry was scheduled after a failure.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Retries are exhausted; the transport is now `Failed`.
    ReconnectExhausted { attempts: u32 },
}

/// How messages are laid out in text frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Every frame is a full envelope.
    #[default]
    Enveloped,
    /// Frames carry the payload alone, as on per-terminal endpoints.
    /// Inbound frames become `terminal` events; no handshake is sent.
    Bare,
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub reconnect: ReconnectPolicy,
    /// Maximum number of drafts held while not connected.
    pub queue_capacity: usize,
    /// Sent as a `system` event every time the connection opens.
    pub handshake: Option<ClientContext>,
    pub framing: Framing,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handshake: None,
            framing: Framing::Enveloped,
        }
    }
}

enum Control {
    Connect,
    Disconnect,
}

struct Cell {
    state: ConnectionState,
    queue: OutboundQueue,
    attempts: u32,
}

struct Shared {
    cell: Mutex<Cell>,
    status: StatusBus,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Cell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a reconnecting transport.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    data: mpsc::UnboundedSender<Outbound>,
    endpoint: Arc<str>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport and spawn its driver task.
    ///
    /// Starts `Disconnected`; call [`Transport::connect`] to open it. The
    /// returned receiver yields every [`TransportEvent`] in order. The driver
    /// stops once every handle is dropped.
    #[must_use]
    pub fn new<C: Connector>(
        connector: C,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let endpoint: Arc<str> = connector.endpoint().into();
        let shared = Arc::new(Shared {
            cell: Mutex::new(Cell {
                state: ConnectionState::Disconnected,
                queue: OutboundQueue::new(config.queue_capacity),
                attempts: 0,
            }),
            status: StatusBus::new(),
        });

        let driver = Driver {
            connector: Arc::new(connector),
            config,
            shared: Arc::clone(&shared),
            endpoint: Arc::clone(&endpoint),
            control: control_rx,
            data: data_rx,
            events: events_tx,
            attempts: 0,
            phase: Phase::Idle,
        };
        tokio::spawn(driver.run());

        let transport = Self {
            shared,
            control: control_tx,
            data: data_tx,
            endpoint,
        };
        (transport, events_rx)
    }

    /// Start connecting. No-op while connecting or connected.
    ///
    /// From `Failed` this resets the attempt counter; from `Reconnecting` it
    /// skips the remaining backoff delay.
    pub fn connect(&self) {
        if self.control.send(Control::Connect).is_err() {
            tracing::debug!(endpoint = %self.endpoint, "Connect on stopped transport");
        }
    }

    /// Close the connection and cancel any pending retry. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect);
    }

    /// Send a draft, or queue it if the connection is not open.
    ///
    /// # Errors
    /// `QueueOverflow` if the draft had to be queued and the queue is full;
    /// `Closed` if the driver task is gone.
    pub fn send(&self, draft: Outbound) -> Result<(), TransportError> {
        let mut cell = self.shared.lock();
        if cell.state.is_connected() {
            self.data.send(draft).map_err(|_| TransportError::Closed)
        } else {
            tracing::trace!(endpoint = %self.endpoint, "Not connected, queueing message");
            cell.queue.push(draft)
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Number of drafts waiting for the connection to open.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Failed attempts since the last successful open. Zero while connected
    /// or after an explicit disconnect.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.lock().attempts
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Observe state transitions from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.status.subscribe()
    }

    /// Current state followed by every later transition.
    #[must_use]
    pub fn status_stream(&self) -> BoxStream<'static, ConnectionState> {
        let cell = self.shared.lock();
        self.shared.status.current_plus_stream(cell.state)
    }
}

enum Phase {
    /// Disconnected or failed.
    Idle,
    Opening(BoxFuture<'static, Result<Connection, TransportError>>),
    Open(Connection),
    Backoff(Pin<Box<Sleep>>),
}

enum Wake {
    Control(Option<Control>),
    Opened(Result<Connection, TransportError>),
    Frame(Option<Result<String, TransportError>>),
    Outbound(Outbound),
    Retry,
}

struct Driver<C> {
    connector: Arc<C>,
    config: TransportConfig,
    shared: Arc<Shared>,
    endpoint: Arc<str>,
    control: mpsc::UnboundedReceiver<Control>,
    data: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
    attempts: u32,
    phase: Phase,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        loop {
            match self.next_wake().await {
                Wake::Control(None) => {
                    self.close().await;
                    tracing::debug!(endpoint = %self.endpoint, "Transport driver stopped");
                    return;
                }
                Wake::Control(Some(Control::Connect)) => self.on_connect(),
                Wake::Control(Some(Control::Disconnect)) => self.close().await,
                Wake::Opened(Ok(connection)) => self.on_open(connection).await,
                Wake::Opened(Err(e)) => {
                    tracing::warn!(endpoint = %self.endpoint, "Failed to connect: {e}");
                    self.lost(Vec::new());
                }
                Wake::Frame(Some(Ok(frame))) => self.on_frame(&frame),
                Wake::Frame(Some(Err(e))) => {
                    tracing::warn!(endpoint = %self.endpoint, "Connection error: {e}");
                    self.lost(Vec::new());
                }
                Wake::Frame(None) => {
                    tracing::warn!(endpoint = %self.endpoint, "Disconnected by server");
                    self.lost(Vec::new());
                }
                Wake::Outbound(draft) => self.write(draft).await,
                Wake::Retry => self.open(),
            }
        }
    }

    async fn next_wake(&mut self) -> Wake {
        let control = &mut self.control;
        match &mut self.phase {
            Phase::Idle => Wake::Control(control.recv().await),
            Phase::Opening(opening) => tokio::select! {
                biased;
                cmd = control.recv() => Wake::Control(cmd),
                res = opening => Wake::Opened(res),
            },
            Phase::Open(connection) => tokio::select! {
                biased;
                cmd = control.recv() => Wake::Control(cmd),
                frame = connection.stream.next() => Wake::Frame(frame),
                Some(draft) = self.data.recv() => Wake::Outbound(draft),
            },
            Phase::Backoff(delay) => tokio::select! {
                biased;
                cmd = control.recv() => Wake::Control(cmd),
                () = delay.as_mut() => Wake::Retry,
            },
        }
    }

    fn on_connect(&mut self) {
        match self.phase {
            Phase::Opening(_) | Phase::Open(_) => {
                tracing::debug!(endpoint = %self.endpoint, "Already connected or connecting");
                return;
            }
            Phase::Backoff(_) => {
                tracing::info!(endpoint = %self.endpoint, "Retrying now");
            }
            Phase::Idle => {
                self.attempts = 0;
            }
        }
        self.open();
    }

    fn open(&mut self) {
        tracing::info!(endpoint = %self.endpoint, attempt = self.attempts, "Connecting");
        let connector = Arc::clone(&self.connector);
        self.phase = Phase::Opening(Box::pin(async move { connector.open().await }));

        let shared = Arc::clone(&self.shared);
        let mut cell = shared.lock();
        cell.attempts = self.attempts;
        self.transition(&mut cell, ConnectionState::Connecting);
    }

    async fn on_open(&mut self, mut connection: Connection) {
        tracing::info!(endpoint = %self.endpoint, "Connected");
        self.attempts = 0;

        let pending = {
            let shared = Arc::clone(&self.shared);
            let mut cell = shared.lock();
            let pending = cell.queue.drain();
            cell.attempts = 0;
            self.transition(&mut cell, ConnectionState::Connected);
            pending
        };

        let framing = self.config.framing;
        match &self.config.handshake {
            Some(_) if framing == Framing::Bare => {
                tracing::debug!(endpoint = %self.endpoint, "Bare framing, skipping handshake");
            }
            Some(handshake) => match handshake.handshake() {
                Ok(draft) => {
                    if let Err(e) = send_frame(&mut connection, draft.seal(), framing).await {
                        tracing::warn!(endpoint = %self.endpoint, "Handshake failed: {e}");
                        self.lost(pending);
                        return;
                    }
                    tracing::info!(
                        endpoint = %self.endpoint,
                        workspaces = handshake.workspaces.len(),
                        "Handshake sent"
                    );
                }
                Err(e) => tracing::error!("Failed to encode handshake: {e}"),
            },
            None => {}
        }

        if !pending.is_empty() {
            tracing::info!(endpoint = %self.endpoint, count = pending.len(), "Sending buffered messages");
        }
        let mut pending = pending.into_iter();
        while let Some(draft) = pending.next() {
            if let Err(e) = send_frame(&mut connection, draft.clone().seal(), framing).await {
                tracing::warn!(endpoint = %self.endpoint, "Flush failed: {e}");
                let mut unsent = vec![draft];
                unsent.extend(pending);
                self.lost(unsent);
                return;
            }
        }

        self.phase = Phase::Open(connection);
    }

    fn on_frame(&self, frame: &str) {
        let decoded = match self.config.framing {
            Framing::Enveloped => Envelope::decode(frame),
            Framing::Bare => Envelope::from_bare(Category::Terminal, frame),
        };
        match decoded {
            Ok(envelope) => {
                tracing::trace!(category = %envelope.category(), id = envelope.id(), "Received message");
                let _ = self.events.send(TransportEvent::Envelope(envelope));
            }
            Err(e) => tracing::warn!(endpoint = %self.endpoint, "Dropping malformed frame: {e}"),
        }
    }

    async fn write(&mut self, draft: Outbound) {
        let Phase::Open(connection) = &mut self.phase else {
            self.lost(vec![draft]);
            return;
        };
        if let Err(e) = send_frame(connection, draft.clone().seal(), self.config.framing).await {
            tracing::warn!(endpoint = %self.endpoint, "Send failed: {e}");
            self.lost(vec![draft]);
        }
    }

    /// The connection (or the attempt to open one) is gone: keep unsent
    /// drafts, then back off or give up.
    fn lost(&mut self, mut unsent: Vec<Outbound>) {
        self.phase = Phase::Idle;

        let shared = Arc::clone(&self.shared);
        let mut cell = shared.lock();
        while let Ok(draft) = self.data.try_recv() {
            unsent.push(draft);
        }
        if !unsent.is_empty() {
            tracing::debug!(endpoint = %self.endpoint, count = unsent.len(), "Requeueing unsent messages");
            cell.queue.requeue_front(unsent);
        }

        let attempt = self.attempts.saturating_add(1);
        if let Some(delay) = self.config.reconnect.delay(attempt) {
            self.attempts = attempt;
            cell.attempts = attempt;
            tracing::info!(
                endpoint = %self.endpoint,
                "Scheduling reconnect attempt {attempt}/{} in {}ms",
                self.config.reconnect.max_attempts,
                delay.as_millis()
            );
            self.phase = Phase::Backoff(Box::pin(tokio::time::sleep(delay)));
            self.transition(&mut cell, ConnectionState::Reconnecting);
            let _ = self
                .events
                .send(TransportEvent::RetryScheduled { attempt, delay });
        } else {
            tracing::error!(
                endpoint = %self.endpoint,
                "Max reconnection attempts ({}) reached. Giving up.",
                self.config.reconnect.max_attempts
            );
            self.transition(&mut cell, ConnectionState::Failed);
            let _ = self.events.send(TransportEvent::ReconnectExhausted {
                attempts: self.attempts,
            });
        }
    }

    /// Explicit disconnect: drop the connection, the timer or the pending open.
    ///
    /// Writes accepted while connected still go out before the close.
    async fn close(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        self.attempts = 0;

        let accepted = {
            let shared = Arc::clone(&self.shared);
            let mut cell = shared.lock();
            let mut accepted = Vec::new();
            while let Ok(draft) = self.data.try_recv() {
                accepted.push(draft);
            }
            cell.attempts = 0;
            self.transition(&mut cell, ConnectionState::Disconnected);
            accepted
        };

        if let Phase::Open(mut connection) = phase {
            tracing::info!(endpoint = %self.endpoint, "Disconnecting");
            let framing = self.config.framing;
            let flush_and_close = async {
                for draft in accepted {
                    send_frame(&mut connection, draft.seal(), framing).await?;
                }
                connection.sink.close().await
            };
            if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, flush_and_close).await {
                tracing::debug!(endpoint = %self.endpoint, "Close failed: {e}");
            }
        } else if !accepted.is_empty() {
            self.shared.lock().queue.requeue_front(accepted);
        }
    }

    /// Change state under the cell lock; notifies only on a real change.
    fn transition(&self, cell: &mut Cell, to: ConnectionState) {
        if cell.state == to {
            return;
        }
        tracing::debug!(endpoint = %self.endpoint, from = ?cell.state, ?to, "Status changed");
        cell.state = to;
        self.shared.status.publish(to);
        let _ = self.events.send(TransportEvent::State(to));
    }
}

async fn send_frame(
    connection: &mut Connection,
    envelope: Envelope,
    framing: Framing,
) -> Result<(), TransportError> {
    let frame = match framing {
        Framing::Enveloped => envelope.encode(),
        Framing::Bare => envelope.encode_payload(),
    }
    .map_err(|e| TransportError::ConnectionLost(format!("encode failed: {e}")))?;
    tracing::trace!(category = %envelope.category(), id = envelope.id(), "Sending message");
    connection.sink.send(frame).await
}
