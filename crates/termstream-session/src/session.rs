//! One mirrored terminal: its transport, tail buffer, writer and line discipline.

use std::{borrow::Cow, time::SystemTime};

use serde::{Deserialize, Serialize};
use termstream_core::{
    BufferStats, Category, CodecError, Dispatcher, Envelope, FlowControl, HandlerError,
    TailBuffer, TerminalEvent, TerminalMessage, tail::DEFAULT_MAX_LINES,
};
use termstream_transport::{
    ConnectionState, Connector, Transport, TransportConfig, TransportError, TransportEvent,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    discipline::{Action, DisciplineMode, LineDiscipline},
    flow::{FlowThresholds, FlowWriter},
    sink::{Notice, OutputSink},
};

/// Identifies a session; the remote process id.
pub type SessionKey = String;

/// Number of tail lines relayed with each output chunk.
pub const DEFAULT_RELAY_LINES: usize = 20;

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionKey),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// How remote output line endings are presented to the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineEndings {
    /// Bare `\n` becomes `\r\n`; existing `\r\n` passes through.
    #[default]
    Crlf,
    Verbatim,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub discipline: DisciplineMode,
    pub max_lines: usize,
    pub relay_lines: usize,
    pub line_endings: LineEndings,
    /// Send `flow` pause/resume envelopes when the sink falls behind.
    pub upstream_backpressure: bool,
    pub flow: FlowThresholds,
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discipline: DisciplineMode::default(),
            max_lines: DEFAULT_MAX_LINES,
            relay_lines: DEFAULT_RELAY_LINES,
            line_endings: LineEndings::default(),
            upstream_backpressure: true,
            flow: FlowThresholds::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub key: SessionKey,
    pub name: String,
    pub command: Option<String>,
    pub stats: BufferStats,
    pub state: ConnectionState,
    /// Failed connection attempts since the last successful open.
    pub reconnect_attempts: u32,
    pub created_at: SystemTime,
}

/// Converts bare `\n` to `\r\n`, also across chunk boundaries.
#[derive(Debug, Clone, Default)]
struct Newlines {
    mode: LineEndings,
    after_cr: bool,
}

impl Newlines {
    fn normalize<'a>(&mut self, data: &'a str) -> Cow<'a, str> {
        if data.is_empty() || self.mode == LineEndings::Verbatim {
            return Cow::Borrowed(data);
        }

        let mut prev_cr = self.after_cr;
        self.after_cr = data.ends_with('\r');

        let mut out: Option<String> = None;
        for (i, c) in data.char_indices() {
            if c == '\n' && !prev_cr {
                out.get_or_insert_with(|| {
                    let mut buf = String::with_capacity(data.len() + 16);
                    buf.push_str(&data[..i]);
                    buf
                })
                .push('\r');
            }
            if let Some(buf) = out.as_mut() {
                buf.push(c);
            }
            prev_cr = c == '\r';
        }
        out.map_or(Cow::Borrowed(data), Cow::Owned)
    }
}

/// Mutable state reachable from inbound handlers.
pub struct SessionState {
    tail: TailBuffer,
    writer: FlowWriter,
    newlines: Newlines,
    discipline: LineDiscipline,
    command: Option<String>,
}

impl SessionState {
    #[must_use]
    pub const fn tail(&self) -> &TailBuffer {
        &self.tail
    }

    #[must_use]
    pub const fn writer(&self) -> &FlowWriter {
        &self.writer
    }

    /// Remote output: keep it in the tail and hand it to the sink.
    fn output(&mut self, data: &str) {
        self.tail.append(data);
        let data = self.newlines.normalize(data);
        self.writer.write(&data);
    }
}

/// A mirrored terminal session.
pub struct Session {
    key: SessionKey,
    name: String,
    created_at: SystemTime,
    config: SessionConfig,
    transport: Transport,
    dispatcher: Dispatcher<SessionState>,
    state: SessionState,
}

/// Receivers that must be pumped into [`Session::on_transport_event`] and
/// [`Session::on_flow_signal`].
pub struct SessionEvents {
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
    pub flow: mpsc::UnboundedReceiver<FlowControl>,
}

impl Session {
    /// Create a session over `connector`. Does not connect.
    #[must_use]
    pub fn new<C: Connector>(
        key: impl Into<SessionKey>,
        name: impl Into<String>,
        connector: C,
        sink: Box<dyn OutputSink>,
        config: SessionConfig,
    ) -> (Self, SessionEvents) {
        let (transport, transport_events) = Transport::new(connector, config.transport.clone());
        let (writer, flow_signals) = FlowWriter::new(sink, config.flow);

        let state = SessionState {
            tail: TailBuffer::new(config.max_lines),
            writer,
            newlines: Newlines {
                mode: config.line_endings,
                after_cr: false,
            },
            discipline: LineDiscipline::new(config.discipline),
            command: None,
        };

        let mut dispatcher = Dispatcher::new();
        dispatcher.on(Category::Terminal, on_terminal);
        dispatcher.on(Category::System, on_system);

        let session = Self {
            key: key.into(),
            name: name.into(),
            created_at: SystemTime::now(),
            config,
            transport,
            dispatcher,
            state,
        };
        let events = SessionEvents {
            transport: transport_events,
            flow: flow_signals,
        };
        (session, events)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.state.command.as_deref()
    }

    /// Register an extra inbound handler, e.g. for `file` or `git` events.
    pub fn on<H>(&mut self, category: Category, handler: H)
    where
        H: termstream_core::Handler<SessionState> + 'static,
    {
        self.dispatcher.on(category, handler);
    }

    pub fn connect(&self) {
        self.transport.connect();
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    /// Keystrokes from the user, through the line discipline.
    ///
    /// # Errors
    /// Returns error if the outbound queue is full or the transport is gone.
    pub fn input(&mut self, data: &str) -> Result<(), SessionError> {
        for action in self.state.discipline.feed(data) {
            match action {
                Action::Send(message) => self.transport.send(message.to_outbound()?)?,
                Action::Echo(text) => self.state.writer.echo(&text),
            }
        }
        Ok(())
    }

    /// Output captured on this side; buffered and relayed as a tail.
    ///
    /// # Errors
    /// Returns error if the relay cannot be queued.
    pub fn record_output(&mut self, chunk: &str) -> Result<(), SessionError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.state.tail.append(chunk);
        let output = self.state.tail.last_lines(self.config.relay_lines).join("\n");
        self.relay(&TerminalEvent::Output {
            terminal: self.name.clone(),
            command: self.state.command.clone(),
            output,
        })
    }

    /// # Errors
    /// Returns error if the relay cannot be queued.
    pub fn command_started(&mut self, command: &str) -> Result<(), SessionError> {
        tracing::debug!(key = %self.key, command, "Command started");
        self.state.command = Some(command.to_string());
        self.relay(&TerminalEvent::CommandStart {
            terminal: self.name.clone(),
            command: command.to_string(),
        })
    }

    /// Relay the end of the running command, plus an error summary if it
    /// failed with error lines in the buffer.
    ///
    /// # Errors
    /// Returns error if a relay cannot be queued.
    pub fn command_ended(&mut self, exit_code: Option<i32>) -> Result<(), SessionError> {
        let command = self
            .state
            .command
            .take()
            .unwrap_or_else(|| "unknown".to_string());
        tracing::debug!(key = %self.key, %command, ?exit_code, "Command ended");

        self.relay(&TerminalEvent::CommandEnd {
            terminal: self.name.clone(),
            command: command.clone(),
            exit_code,
        })?;

        if let Some(code) = exit_code.filter(|code| *code != 0) {
            let errors: Vec<String> = self
                .state
                .tail
                .errors()
                .into_iter()
                .map(str::to_string)
                .collect();
            if !errors.is_empty() {
                tracing::info!(key = %self.key, count = errors.len(), "[ERRORS DETECTED]");
                self.relay(&TerminalEvent::ErrorSummary {
                    terminal: self.name.clone(),
                    command,
                    exit_code: code,
                    errors,
                })?;
            }
        }
        Ok(())
    }

    /// Relay final statistics and disconnect.
    pub fn close(&mut self) -> BufferStats {
        let stats = self.state.tail.stats();
        let closed = TerminalEvent::Closed {
            terminal: self.name.clone(),
            stats,
        };
        if let Err(e) = self.relay(&closed) {
            tracing::warn!(key = %self.key, "Failed to relay close: {e}");
        }
        self.transport.disconnect();
        stats
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            key: self.key.clone(),
            name: self.name.clone(),
            command: self.state.command.clone(),
            stats: self.state.tail.stats(),
            state: self.transport.state(),
            reconnect_attempts: self.transport.attempts(),
            created_at: self.created_at,
        }
    }

    /// Apply one transport event.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if let TransportEvent::Envelope(envelope) = event {
            self.dispatcher.dispatch(&mut self.state, &envelope);
            return;
        }

        let paused = self.state.writer.is_paused();
        let sink = self.state.writer.sink_mut();
        match event {
            TransportEvent::State(state) => {
                sink.status(state, paused);
                if state == ConnectionState::Disconnected {
                    sink.notice(Notice::Disconnected);
                }
            }
            TransportEvent::RetryScheduled { attempt, delay } => {
                sink.notice(Notice::Reconnecting { attempt, delay });
            }
            TransportEvent::ReconnectExhausted { attempts } => {
                sink.notice(Notice::ReconnectFailed { attempts });
            }
            TransportEvent::Envelope(_) => {}
        }
    }

    /// Apply one pause/resume transition of the writer.
    ///
    /// Upstream signals are only sent on an open connection; a queued one
    /// would be stale by the time it is flushed.
    pub fn on_flow_signal(&mut self, signal: FlowControl) {
        if self.config.upstream_backpressure {
            if !self.transport.is_connected() {
                tracing::debug!(key = %self.key, ?signal, "Not connected, dropping flow control");
            } else if let Err(e) = self.transport.send(signal.to_outbound()) {
                tracing::warn!(key = %self.key, ?signal, "Failed to send flow control: {e}");
            }
        }
        let paused = matches!(signal, FlowControl::Pause);
        let state = self.transport.state();
        self.state.writer.sink_mut().status(state, paused);
    }

    pub(crate) fn relay(&self, event: &TerminalEvent) -> Result<(), SessionError> {
        self.transport.send(event.to_outbound()?)?;
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

fn on_terminal(state: &mut SessionState, envelope: &Envelope) -> Result<(), HandlerError> {
    match envelope.payload_as::<TerminalMessage>()? {
        TerminalMessage::Output { data } => state.output(&data),
        TerminalMessage::Error { message } => {
            tracing::warn!("Remote terminal error: {message}");
            state.writer.sink_mut().notice(Notice::RemoteError(message));
        }
        other => {
            return Err(HandlerError::Failed(format!(
                "unexpected terminal message from server: {other:?}"
            )));
        }
    }
    Ok(())
}

fn on_system(_state: &mut SessionState, envelope: &Envelope) -> Result<(), HandlerError> {
    tracing::info!(id = envelope.id(), payload = %envelope.payload(), "System message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use termstream_transport::{MemoryServer, memory_pair};
    use tokio_test::assert_ok;

    use super::*;
    use crate::sink::{ChannelSink, SinkEvent};

    fn session(
        config: SessionConfig,
    ) -> (
        Session,
        SessionEvents,
        MemoryServer,
        mpsc::UnboundedReceiver<SinkEvent>,
    ) {
        let (connector, server) = memory_pair("42");
        let (sink, sink_events) = ChannelSink::new();
        let (session, events) = Session::new("42", "build", connector, Box::new(sink), config);
        (session, events, server, sink_events)
    }

    fn outputs(sink: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = sink.try_recv() {
            if let SinkEvent::Output { data, .. } = event {
                seen.push(data);
            }
        }
        seen
    }

    async fn pump_until_envelope(session: &mut Session, events: &mut SessionEvents) {
        loop {
            let event = events.transport.recv().await.unwrap();
            let is_envelope = matches!(event, TransportEvent::Envelope(_));
            session.on_transport_event(event);
            if is_envelope {
                return;
            }
        }
    }

    async fn pump_until_connected(session: &mut Session, events: &mut SessionEvents) {
        while !session.transport().is_connected() {
            let event = events.transport.recv().await.unwrap();
            session.on_transport_event(event);
        }
    }

    #[test]
    fn test_newlines_across_chunks() {
        let mut newlines = Newlines::default();
        assert_eq!(newlines.normalize("a\nb"), "a\r\nb");
        assert_eq!(newlines.normalize("c\r\nd"), "c\r\nd");
        assert_eq!(newlines.normalize("e\r"), "e\r");
        assert_eq!(newlines.normalize("\nf\n"), "\nf\r\n");

        let mut verbatim = Newlines {
            mode: LineEndings::Verbatim,
            after_cr: false,
        };
        assert_eq!(verbatim.normalize("a\nb"), "a\nb");
    }

    #[tokio::test]
    async fn test_cooked_input_sends_one_line() {
        let (mut session, _events, mut server, mut sink) = session(SessionConfig::default());
        session.connect();
        let mut peer = server.accept().await.unwrap();

        for key in ["h", "i", "\x7f", "i", "\r"] {
            assert_ok!(session.input(key));
        }

        let envelope = peer.recv_envelope().await.unwrap();
        assert_eq!(envelope.category(), Category::Terminal);
        assert_eq!(
            envelope.payload_as::<TerminalMessage>().unwrap(),
            TerminalMessage::input("hi")
        );
        assert_eq!(outputs(&mut sink).concat(), "hi\x08 \x08i\r\n");
    }

    #[tokio::test]
    async fn test_remote_output_reaches_tail_and_sink() {
        let (mut session, mut events, mut server, mut sink) = session(SessionConfig::default());
        session.connect();
        let peer = server.accept().await.unwrap();

        let output = TerminalMessage::Output {
            data: "compiling\nerror: oops\n".to_string(),
        };
        peer.send(&output.to_outbound().unwrap().seal());
        pump_until_envelope(&mut session, &mut events).await;

        assert_eq!(outputs(&mut sink), vec!["compiling\r\nerror: oops\r\n"]);
        assert_eq!(session.state().tail().errors(), vec!["error: oops"]);
        assert_eq!(session.state().writer().watermark(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_becomes_notice() {
        let (mut session, mut events, mut server, mut sink) = session(SessionConfig::default());
        session.connect();
        let peer = server.accept().await.unwrap();

        let error = TerminalMessage::Error {
            message: "process exited".to_string(),
        };
        peer.send(&error.to_outbound().unwrap().seal());
        pump_until_envelope(&mut session, &mut events).await;

        let mut notices = Vec::new();
        while let Ok(event) = sink.try_recv() {
            if let SinkEvent::Notice(notice) = event {
                notices.push(notice);
            }
        }
        assert_eq!(notices, vec![Notice::RemoteError("process exited".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_command_relays_error_summary() {
        let (mut session, _events, mut server, _sink) = session(SessionConfig::default());

        assert_ok!(session.command_started("cargo build"));
        assert_ok!(session.record_output("Compiling\nerror[E0308]: mismatched types"));
        assert_ok!(session.command_ended(Some(101)));
        assert_eq!(session.command(), None);

        session.connect();
        let mut peer = server.accept().await.unwrap();
        let mut relayed = Vec::new();
        for _ in 0..4 {
            let envelope = peer.recv_envelope().await.unwrap();
            relayed.push(envelope.payload_as::<TerminalEvent>().unwrap());
        }

        assert!(matches!(&relayed[0], TerminalEvent::CommandStart { command, .. } if command == "cargo build"));
        assert!(matches!(&relayed[1], TerminalEvent::Output { output, .. } if output.ends_with("mismatched types")));
        assert!(matches!(&relayed[2], TerminalEvent::CommandEnd { exit_code: Some(101), .. }));
        assert_eq!(
            relayed[3],
            TerminalEvent::ErrorSummary {
                terminal: "build".to_string(),
                command: "cargo build".to_string(),
                exit_code: 101,
                errors: vec!["error[E0308]: mismatched types".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_successful_command_has_no_summary() {
        let (mut session, _events, _server, _sink) = session(SessionConfig::default());

        assert_ok!(session.record_output("warning: fail-safe enabled"));
        assert_ok!(session.command_ended(Some(0)));

        // output relay and command_end only
        assert_eq!(session.transport().queued(), 2);
    }

    #[tokio::test]
    async fn test_output_relay_carries_tail_only() {
        let config = SessionConfig {
            relay_lines: 2,
            ..SessionConfig::default()
        };
        let (mut session, _events, mut server, _sink) = session(config);
        assert_ok!(session.record_output("one\ntwo\nthree"));

        session.connect();
        let mut peer = server.accept().await.unwrap();
        let relayed: TerminalEvent = peer.recv_envelope().await.unwrap().payload_as().unwrap();
        assert_eq!(
            relayed,
            TerminalEvent::Output {
                terminal: "build".to_string(),
                command: None,
                output: "two\nthree".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_flow_signal_goes_upstream() {
        let (mut session, mut events, mut server, mut sink) = session(SessionConfig::default());
        session.connect();
        let mut peer = server.accept().await.unwrap();
        pump_until_connected(&mut session, &mut events).await;
        while sink.try_recv().is_ok() {}

        session.on_flow_signal(FlowControl::Pause);
        let envelope = peer.recv_envelope().await.unwrap();
        assert_eq!(envelope.category(), Category::Flow);
        assert_eq!(envelope.payload_as::<FlowControl>().unwrap(), FlowControl::Pause);

        assert!(matches!(
            sink.try_recv(),
            Ok(SinkEvent::Status { paused: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_flow_signal_not_queued_while_disconnected() {
        let (mut session, _events, _server, mut sink) = session(SessionConfig::default());
        session.on_flow_signal(FlowControl::Pause);
        session.on_flow_signal(FlowControl::Resume);

        assert_eq!(session.transport().queued(), 0);
        assert!(matches!(
            sink.try_recv(),
            Ok(SinkEvent::Status { paused: true, .. })
        ));
        assert!(matches!(
            sink.try_recv(),
            Ok(SinkEvent::Status { paused: false, .. })
        ));
    }

    #[tokio::test]
    async fn test_bare_terminal_endpoint() {
        let mut config = SessionConfig::default();
        config.transport.framing = termstream_transport::Framing::Bare;
        let (mut session, mut events, mut server, mut sink) = session(config);
        session.connect();
        let mut peer = server.accept().await.unwrap();

        peer.send_raw(r#"{"type":"output","data":"hello\n"}"#);
        pump_until_envelope(&mut session, &mut events).await;
        assert_eq!(outputs(&mut sink), vec!["hello\r\n"]);

        assert_ok!(session.input("ls\r"));
        let frame = peer.recv().await.unwrap();
        let sent: TerminalMessage = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent, TerminalMessage::input("ls"));
    }

    #[tokio::test]
    async fn test_stats_report_reconnect_attempts() {
        let (mut session, mut events, server, _sink) = session(SessionConfig::default());
        server.refuse(true);
        session.connect();
        while session.stats().state != ConnectionState::Reconnecting {
            let event = events.transport.recv().await.unwrap();
            session.on_transport_event(event);
        }
        assert_eq!(session.stats().reconnect_attempts, 1);
    }

    #[tokio::test]
    async fn test_flow_signal_stays_local_when_disabled() {
        let config = SessionConfig {
            upstream_backpressure: false,
            ..SessionConfig::default()
        };
        let (mut session, _events, _server, _sink) = session(config);
        session.on_flow_signal(FlowControl::Pause);
        assert_eq!(session.transport().queued(), 0);
    }

    #[tokio::test]
    async fn test_close_relays_stats() {
        let (mut session, _events, _server, _sink) = session(SessionConfig::default());
        assert_ok!(session.record_output("a\nb"));

        let stats = session.close();
        assert_eq!(stats.lines_buffered, 2);
        assert_eq!(stats.total_received, 2);
        assert_eq!(session.transport().queued(), 2);
    }
}
