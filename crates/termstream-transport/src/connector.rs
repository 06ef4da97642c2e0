//! The seam between a transport and the network.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::TransportError;

/// Write half of an open connection, carrying text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Read half of an open connection. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// An open bidirectional text-frame connection.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens connections to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    async fn open(&self) -> Result<Connection, TransportError>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// Produces the connector for a session key (one endpoint per remote process).
pub trait ConnectorFactory: Send + Sync + 'static {
    type Connector: Connector;

    fn connector_for(&self, key: &str) -> Self::Connector;
}
