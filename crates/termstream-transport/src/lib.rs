//! Reconnecting transport for terminal sessions.
//!
//! Provides:
//! - `Transport` - Connection state machine with backoff and outbound queueing
//! - `Connector` - Seam to the network (WebSocket, in-memory)
//! - `StatusBus` - Broadcast of connection state transitions

pub mod connector;
pub mod memory;
pub mod policy;
pub mod queue;
pub mod status;
pub mod transport;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use connector::{Connection, Connector, ConnectorFactory};
pub use memory::{MemoryConnector, MemoryNetwork, MemoryPeer, MemoryServer, memory_pair};
pub use policy::ReconnectPolicy;
pub use queue::OutboundQueue;
pub use status::{ConnectionState, StatusBus};
pub use transport::{Framing, Transport, TransportConfig, TransportError, TransportEvent};

#[cfg(feature = "websocket")]
pub use websocket::{TerminalEndpoints, WebSocketConnector};
