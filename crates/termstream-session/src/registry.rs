//! Registry of live sessions, one per remote process.

use std::{collections::HashMap, sync::Arc};

use termstream_core::{BufferStats, FlowControl, TerminalEvent};
use termstream_transport::{ConnectorFactory, TransportEvent};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
};

use crate::{
    session::{Session, SessionConfig, SessionError, SessionEvents, SessionKey, SessionStats},
    sink::{NullSink, OutputSink},
};

/// Builds the output sink of a new session from its key.
pub type SinkFactory = Box<dyn Fn(&str) -> Box<dyn OutputSink> + Send + Sync>;

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    /// Feeds transport events and flow signals into the session.
    pump: JoinHandle<()>,
}

/// Tracks every mirrored terminal and routes lifecycle signals to it.
pub struct SessionRegistry<F: ConnectorFactory> {
    connectors: F,
    config: SessionConfig,
    sinks: SinkFactory,
    sessions: RwLock<HashMap<SessionKey, SessionEntry>>,
}

impl<F: ConnectorFactory> SessionRegistry<F> {
    /// Create an empty registry. Output is discarded until a sink factory is set.
    #[must_use]
    pub fn new(connectors: F, config: SessionConfig) -> Self {
        Self {
            connectors,
            config,
            sinks: Box::new(null_sink),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Use `sinks` for sessions created from now on.
    #[must_use]
    pub fn with_sinks<S>(mut self, sinks: S) -> Self
    where
        S: Fn(&str) -> Box<dyn OutputSink> + Send + Sync + 'static,
    {
        self.sinks = Box::new(sinks);
        self
    }

    /// A remote process appeared: create its session and start connecting.
    ///
    /// Returns `false` if the key is already tracked.
    ///
    /// # Errors
    /// Returns error if the creation notice cannot be queued.
    pub async fn process_created(&self, key: &str, name: &str) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(key) {
            tracing::debug!(key, "Session already exists, ignoring");
            return Ok(false);
        }

        let connector = self.connectors.connector_for(key);
        let sink = (self.sinks)(key);
        let (session, events) = Session::new(key, name, connector, sink, self.config.clone());
        tracing::info!(key, name, endpoint = session.transport().endpoint(), "Terminal created");

        session.relay(&TerminalEvent::Output {
            terminal: name.to_string(),
            command: None,
            output: format!("[Terminal created: {name}]"),
        })?;
        session.connect();

        let session = Arc::new(Mutex::new(session));
        let pump = tokio::spawn(pump(Arc::clone(&session), events));
        sessions.insert(key.to_string(), SessionEntry { session, pump });
        Ok(true)
    }

    /// The remote process ended: relay final statistics and drop the session.
    ///
    /// Unknown keys are ignored.
    pub async fn process_closed(&self, key: &str) -> Option<BufferStats> {
        let stats = self.close(key).await;
        if let Some(stats) = &stats {
            tracing::info!(
                key,
                lines = stats.lines_buffered,
                total = stats.total_received,
                errors = stats.errors,
                "Terminal closed"
            );
        }
        stats
    }

    /// Tear down one session. Idempotent.
    pub async fn close(&self, key: &str) -> Option<BufferStats> {
        let entry = self.sessions.write().await.remove(key)?;
        let stats = entry.session.lock().await.close();
        entry.pump.abort();
        Some(stats)
    }

    /// Tear down every session. Idempotent.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.sessions.write().await.drain().collect();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Shutting down sessions");
        }
        for (_, entry) in entries {
            entry.session.lock().await.close();
            entry.pump.abort();
        }
    }

    /// # Errors
    /// `NotFound` for an unknown key, or a relay failure.
    pub async fn command_started(&self, key: &str, command: &str) -> Result<(), SessionError> {
        self.require(key).await?.lock().await.command_started(command)
    }

    /// # Errors
    /// `NotFound` for an unknown key, or a relay failure.
    pub async fn command_ended(&self, key: &str, exit_code: Option<i32>) -> Result<(), SessionError> {
        self.require(key).await?.lock().await.command_ended(exit_code)
    }

    /// # Errors
    /// `NotFound` for an unknown key, or a relay failure.
    pub async fn output_chunk(&self, key: &str, chunk: &str) -> Result<(), SessionError> {
        self.require(key).await?.lock().await.record_output(chunk)
    }

    /// # Errors
    /// `NotFound` for an unknown key, or a send failure.
    pub async fn input(&self, key: &str, data: &str) -> Result<(), SessionError> {
        self.require(key).await?.lock().await.input(data)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(key)
            .map(|entry| Arc::clone(&entry.session))
    }

    /// Tracked keys, sorted.
    pub async fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of every session, sorted by key.
    pub async fn statistics(&self) -> Vec<SessionStats> {
        let sessions: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.session))
            .collect();

        let mut stats = Vec::with_capacity(sessions.len());
        for session in sessions {
            stats.push(session.lock().await.stats());
        }
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    async fn require(&self, key: &str) -> Result<Arc<Mutex<Session>>, SessionError> {
        self.get(key)
            .await
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }
}

impl<F: ConnectorFactory> Drop for SessionRegistry<F> {
    /// Sessions still tracked are disconnected and their pumps stopped, so
    /// their connections close instead of outliving the registry.
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut();
        if !sessions.is_empty() {
            tracing::debug!(count = sessions.len(), "Registry dropped with live sessions");
        }
        for (key, entry) in sessions.drain() {
            entry.pump.abort();
            match entry.session.try_lock() {
                Ok(session) => session.disconnect(),
                Err(_) => tracing::debug!(key = %key, "Session busy on drop, closing with its pump"),
            }
        }
    }
}

fn null_sink(_key: &str) -> Box<dyn OutputSink> {
    Box::new(NullSink)
}

async fn pump(session: Arc<Mutex<Session>>, mut events: SessionEvents) {
    enum Next {
        Transport(TransportEvent),
        Flow(FlowControl),
    }

    loop {
        let next = tokio::select! {
            event = events.transport.recv() => match event {
                Some(event) => Next::Transport(event),
                None => break,
            },
            Some(signal) = events.flow.recv() => Next::Flow(signal),
        };

        let mut guard = session.lock().await;
        match next {
            Next::Transport(event) => guard.on_transport_event(event),
            Next::Flow(signal) => guard.on_flow_signal(signal),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use termstream_core::{Category, Envelope, TerminalMessage};
    use termstream_transport::{ConnectionState, MemoryNetwork};
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    use super::*;
    use crate::{
        discipline::DisciplineMode,
        sink::{ChannelSink, SinkEvent},
    };

    fn registry(network: &Arc<MemoryNetwork>) -> SessionRegistry<Arc<MemoryNetwork>> {
        SessionRegistry::new(Arc::clone(network), SessionConfig::default())
    }

    fn terminal_event(envelope: &Envelope) -> TerminalEvent {
        assert_eq!(envelope.category(), Category::Terminal);
        envelope.payload_as().unwrap()
    }

    #[tokio::test]
    async fn test_created_connects_and_announces() {
        let network = Arc::new(MemoryNetwork::new());
        let registry = registry(&network);

        assert!(assert_ok!(registry.process_created("100", "build").await));
        let mut server = network.take_server("100").unwrap();
        let mut peer = server.accept().await.unwrap();

        let announced = terminal_event(&peer.recv_envelope().await.unwrap());
        assert_eq!(
            announced,
            TerminalEvent::Output {
                terminal: "build".to_string(),
                command: None,
                output: "[Terminal created: build]".to_string(),
            }
        );
        assert_eq!(registry.keys().await, vec!["100".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_created_is_ignored() {
        let network = Arc::new(MemoryNetwork::new());
        let registry = registry(&network);

        assert!(registry.process_created("7", "a").await.unwrap());
        let server = network.take_server("7").unwrap();
        assert!(!registry.process_created("7", "a").await.unwrap());

        assert_eq!(registry.len().await, 1);
        assert!(network.take_server("7").is_none());
        tokio::task::yield_now().await;
        assert!(server.attempts() <= 1);
    }

    #[tokio::test]
    async fn test_closed_relays_stats_and_removes() {
        let network = Arc::new(MemoryNetwork::new());
        let registry = registry(&network);
        registry.process_created("9", "tests").await.unwrap();
        let mut peer = network.take_server("9").unwrap().accept().await.unwrap();

        assert_ok!(registry.output_chunk("9", "running\nFAILED: 1 test").await);
        let stats = registry.process_closed("9").await.unwrap();
        assert_eq!(stats.lines_buffered, 2);
        assert_eq!(stats.errors, 1);

        let mut last = None;
        while let Some(envelope) = peer.recv_envelope().await {
            last = Some(terminal_event(&envelope));
        }
        assert_eq!(
            last,
            Some(TerminalEvent::Closed {
                terminal: "tests".to_string(),
                stats,
            })
        );

        assert!(registry.is_empty().await);
        assert_eq!(registry.process_closed("9").await, None);
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let network = Arc::new(MemoryNetwork::new());
        let registry = registry(&network);

        assert!(matches!(
            registry.command_started("nope", "ls").await,
            Err(SessionError::NotFound(key)) if key == "nope"
        ));
        assert!(matches!(
            registry.input("nope", "x").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(registry.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_pump_delivers_remote_output_to_sink() {
        let network = Arc::new(MemoryNetwork::new());
        let (sink, mut sink_events) = ChannelSink::new();
        let config = SessionConfig {
            discipline: DisciplineMode::Raw,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(Arc::clone(&network), config)
            .with_sinks(move |_| Box::new(sink.clone()));

        registry.process_created("5", "shell").await.unwrap();
        let mut peer = network.take_server("5").unwrap().accept().await.unwrap();
        let _announce = peer.recv_envelope().await.unwrap();

        registry.input("5", "ls\r").await.unwrap();
        let input: TerminalMessage = peer.recv_envelope().await.unwrap().payload_as().unwrap();
        assert_eq!(input, TerminalMessage::input("ls\r"));

        let output = TerminalMessage::Output {
            data: "file.txt\n".to_string(),
        };
        peer.send(&output.to_outbound().unwrap().seal());

        let data = next_output(&mut sink_events).await;
        assert_eq!(data, "file.txt\r\n");

        let session = registry.get("5").await.unwrap();
        let session = session.lock().await;
        assert_eq!(session.state().tail().last_lines(1), vec![""]);
        assert_eq!(session.transport().state(), ConnectionState::Connected);
    }

    async fn next_output(events: &mut mpsc::UnboundedReceiver<SinkEvent>) -> String {
        while let Some(event) = events.recv().await {
            if let SinkEvent::Output { data, .. } = event {
                return data;
            }
        }
        panic!("sink closed");
    }

    #[tokio::test]
    async fn test_drop_closes_connections() {
        let network = Arc::new(MemoryNetwork::new());
        let registry = registry(&network);
        registry.process_created("3", "watch").await.unwrap();
        let mut peer = network.take_server("3").unwrap().accept().await.unwrap();
        let _announce = peer.recv_envelope().await.unwrap();

        drop(registry);
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while peer.recv().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "connection outlived the registry");
    }

    #[tokio::test]
    async fn test_statistics_and_shutdown() {
        let network = Arc::new(MemoryNetwork::new());
        let registry = registry(&network);
        registry.process_created("2", "beta").await.unwrap();
        registry.process_created("1", "alpha").await.unwrap();
        registry.command_started("1", "npm test").await.unwrap();

        let stats = registry.statistics().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "alpha");
        assert_eq!(stats[0].command.as_deref(), Some("npm test"));
        assert_eq!(stats[1].command, None);

        registry.shutdown().await;
        registry.shutdown().await;
        assert!(registry.is_empty().await);
    }
}
