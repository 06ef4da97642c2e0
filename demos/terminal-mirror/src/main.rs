//! Mirror a remote terminal process in the local terminal.
//!
//! Run with: cargo run -p terminal-mirror -- ws://localhost:8765/ws <process-id> [--raw] [--bare]
//!
//! Keystrokes go through the session's line discipline; remote output is
//! written to stdout. Press Ctrl+] to quit.

use std::{
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, bail};
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use termstream_core::{ClientContext, WorkspaceInfo};
use termstream_session::{
    ChannelSink, DisciplineMode, Notice, SessionConfig, SessionRegistry, SinkEvent,
    keys::key_to_input,
};
use termstream_transport::{Framing, TerminalEndpoints, TransportConfig};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Input {
    Keys(String),
    Quit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the mirrored terminal
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(base), Some(process_id)) = (args.next(), args.next()) else {
        bail!("usage: terminal-mirror <base-url> <process-id> [--raw] [--bare]");
    };
    let flags: Vec<String> = args.collect();
    let framing = if flags.iter().any(|arg| arg == "--bare") {
        Framing::Bare
    } else {
        Framing::Enveloped
    };
    let discipline = if flags.iter().any(|arg| arg == "--raw") {
        DisciplineMode::Raw
    } else {
        DisciplineMode::Cooked
    };

    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = SessionConfig {
        discipline,
        transport: TransportConfig {
            handshake: Some(
                ClientContext::new(env!("CARGO_PKG_VERSION"))
                    .with_workspace(WorkspaceInfo::folder(working_dir)),
            ),
            framing,
            ..TransportConfig::default()
        },
        ..SessionConfig::default()
    };

    let (sink, mut output) = ChannelSink::new();
    let registry = SessionRegistry::new(TerminalEndpoints::new(&base), config)
        .with_sinks(move |_| Box::new(sink.clone()));
    registry
        .process_created(&process_id, &format!("process {process_id}"))
        .await?;

    enable_raw_mode().context("failed to enable raw mode")?;
    let result = run(&registry, &process_id, &mut output).await;
    disable_raw_mode()?;

    if let Some(stats) = registry.process_closed(&process_id).await {
        eprintln!(
            "{} lines received, {} errors in the last {}",
            stats.total_received, stats.errors, stats.lines_buffered
        );
    }
    result
}

async fn run(
    registry: &SessionRegistry<TerminalEndpoints>,
    process_id: &str,
    output: &mut mpsc::UnboundedReceiver<SinkEvent>,
) -> anyhow::Result<()> {
    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || read_keys(&input_tx));

    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            input = input_rx.recv() => match input {
                Some(Input::Keys(keys)) => {
                    if let Err(e) = registry.input(process_id, &keys).await {
                        tracing::warn!("Input dropped: {e}");
                    }
                }
                Some(Input::Quit) | None => return Ok(()),
            },
            Some(event) = output.recv() => match event {
                SinkEvent::Output { data, done } => {
                    stdout.write_all(data.as_bytes())?;
                    stdout.flush()?;
                    done.complete();
                }
                SinkEvent::Status { state, paused } => {
                    tracing::info!(?state, paused, "Session status");
                }
                SinkEvent::Notice(notice) => {
                    let text = match notice {
                        Notice::RemoteError(message) => format!("[Error: {message}]"),
                        Notice::Disconnected => "[Disconnected]".to_string(),
                        Notice::Reconnecting { attempt, delay } => {
                            format!("[Reconnecting in {}s, attempt {attempt}]", delay.as_secs())
                        }
                        Notice::ReconnectFailed { attempts } => {
                            format!("[Gave up after {attempts} attempts]")
                        }
                    };
                    write!(stdout, "\r\n{text}\r\n")?;
                    stdout.flush()?;
                }
            },
        }
    }
}

/// Blocking crossterm reader; stops on Ctrl+] or when the receiver is gone.
fn read_keys(tx: &mpsc::UnboundedSender<Input>) {
    loop {
        match event::poll(Duration::from_millis(100)) {
            Ok(false) => {
                if tx.is_closed() {
                    return;
                }
                continue;
            }
            Ok(true) => {}
            Err(e) => {
                tracing::error!("Failed to poll terminal: {e}");
                let _ = tx.send(Input::Quit);
                return;
            }
        }

        let Ok(Event::Key(key)) = event::read() else {
            continue;
        };
        if key.code == KeyCode::Char(']') && key.modifiers.contains(KeyModifiers::CONTROL) {
            let _ = tx.send(Input::Quit);
            return;
        }
        if let Some(keys) = key_to_input(&key) {
            if tx.send(Input::Keys(keys)).is_err() {
                return;
            }
        }
    }
}
