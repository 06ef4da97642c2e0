//! In-memory connector.
//!
//! Useful for tests and for wiring a front-end to an in-process backend.
//! Every `open` hands the server side a [`MemoryPeer`]; dropping the peer
//! closes the connection from the client's point of view.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, channel::mpsc as frames};
use termstream_core::Envelope;
use tokio::sync::mpsc;

use crate::{
    TransportError,
    connector::{Connection, Connector, ConnectorFactory},
};

struct Inner {
    name: String,
    refusing: AtomicBool,
    attempts: AtomicU32,
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Client side: opens connections to the paired [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

/// Server side: accepts connections and controls whether they succeed.
pub struct MemoryServer {
    inner: Arc<Inner>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Create a connected client/server pair.
#[must_use]
pub fn memory_pair(name: impl Into<String>) -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let inner = Arc::new(Inner {
        name: name.into(),
        refusing: AtomicBool::new(false),
        attempts: AtomicU32::new(0),
        accept_tx,
    });
    (
        MemoryConnector {
            inner: Arc::clone(&inner),
        },
        MemoryServer { inner, accept_rx },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Connection, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(format!(
                "{}: connection refused",
                self.inner.name
            )));
        }

        let (to_server_tx, to_server_rx) = frames::unbounded::<String>();
        let (to_client_tx, to_client_rx) = frames::unbounded::<Result<String, TransportError>>();

        let peer = MemoryPeer {
            incoming: to_server_rx,
            outgoing: to_client_tx,
        };
        self.inner
            .accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed(format!("{}: server gone", self.inner.name)))?;

        let sink = to_server_tx.sink_map_err(|e| TransportError::ConnectionLost(e.to_string()));
        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(to_client_rx),
        })
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.inner.name)
    }
}

impl MemoryServer {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Make subsequent `open` calls fail (or succeed again).
    pub fn refuse(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Number of `open` calls so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one in-memory connection.
pub struct MemoryPeer {
    incoming: frames::UnboundedReceiver<String>,
    outgoing: frames::UnboundedSender<Result<String, TransportError>>,
}

impl MemoryPeer {
    /// Next raw frame from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.next().await
    }

    /// Next frame from the client, decoded.
    ///
    /// # Panics
    /// Panics if the client sent a malformed frame.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let frame = self.recv().await?;
        Some(Envelope::decode(&frame).unwrap_or_else(|e| panic!("bad frame {frame:?}: {e}")))
    }

    /// Send an envelope to the client.
    pub fn send(&self, envelope: &Envelope) {
        if let Ok(frame) = envelope.encode() {
            self.send_raw(frame);
        }
    }

    /// Send an arbitrary text frame to the client.
    pub fn send_raw(&self, frame: impl Into<String>) {
        let _ = self.outgoing.unbounded_send(Ok(frame.into()));
    }

    /// Break the connection with a transport-level error.
    pub fn fail(self, reason: &str) {
        let _ = self
            .outgoing
            .unbounded_send(Err(TransportError::ConnectionLost(reason.to_string())));
    }
}

/// One in-memory endpoint per session key, created on first use.
#[derive(Default)]
pub struct MemoryNetwork {
    servers: Mutex<HashMap<String, MemoryServer>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the server side for `key`, if a connector was handed out for it.
    pub fn take_server(&self, key: &str) -> Option<MemoryServer> {
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

impl ConnectorFactory for MemoryNetwork {
    type Connector = MemoryConnector;

    fn connector_for(&self, key: &str) -> MemoryConnector {
        let (connector, server) = memory_pair(key);
        self.servers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), server);
        connector
    }
}

impl ConnectorFactory for Arc<MemoryNetwork> {
    type Connector = MemoryConnector;

    fn connector_for(&self, key: &str) -> MemoryConnector {
        self.as_ref().connector_for(key)
    }
}
