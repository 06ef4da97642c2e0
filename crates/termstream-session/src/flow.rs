//! Watermark-based flow control between a transport and a slow sink.
//!
//! Every chunk handed to the sink raises the watermark by its length; the
//! [`WriteCompletion`] that travels with it lowers the watermark again once
//! the sink has consumed the chunk. Crossing the high threshold pauses,
//! falling under the low one resumes. Transitions are published as
//! [`FlowControl`] signals.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use termstream_core::FlowControl;
use tokio::sync::mpsc;

use crate::sink::OutputSink;

pub const HIGH_WATERMARK: usize = 100_000;
pub const LOW_WATERMARK: usize = 10_000;

/// Pause/resume thresholds in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlowThresholds {
    pub high: usize,
    pub low: usize,
}

impl Default for FlowThresholds {
    fn default() -> Self {
        Self {
            high: HIGH_WATERMARK,
            low: LOW_WATERMARK,
        }
    }
}

/// Watermark bookkeeping, free of any I/O.
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    thresholds: FlowThresholds,
    watermark: usize,
    paused: bool,
}

impl FlowState {
    #[must_use]
    pub fn new(thresholds: FlowThresholds) -> Self {
        Self {
            thresholds,
            watermark: 0,
            paused: false,
        }
    }

    /// Account for `len` bytes handed to the sink.
    pub fn admit(&mut self, len: usize) -> Option<FlowControl> {
        self.watermark = self.watermark.saturating_add(len);
        if !self.paused && self.watermark > self.thresholds.high {
            self.paused = true;
            return Some(FlowControl::Pause);
        }
        None
    }

    /// Account for `len` bytes the sink has finished with.
    pub fn release(&mut self, len: usize) -> Option<FlowControl> {
        self.watermark = self.watermark.saturating_sub(len);
        if self.paused && self.watermark < self.thresholds.low {
            self.paused = false;
            return Some(FlowControl::Resume);
        }
        None
    }

    #[must_use]
    pub const fn watermark(&self) -> usize {
        self.watermark
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }
}

struct FlowShared {
    state: Mutex<FlowState>,
    signals: mpsc::UnboundedSender<FlowControl>,
}

impl FlowShared {
    fn release(&self, len: usize) {
        let signal = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(len);
        if let Some(signal) = signal {
            tracing::debug!(?signal, "Sink drained below low watermark");
            let _ = self.signals.send(signal);
        }
    }
}

/// Acknowledges one chunk. Completing it, or dropping it, lowers the watermark.
#[must_use = "dropping a completion acknowledges the chunk immediately"]
pub struct WriteCompletion {
    len: usize,
    shared: Option<Arc<FlowShared>>,
}

impl WriteCompletion {
    /// A completion that accounts for nothing, for writes outside flow control.
    pub const fn detached() -> Self {
        Self {
            len: 0,
            shared: None,
        }
    }

    /// Number of bytes this completion releases.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the chunk as consumed.
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for WriteCompletion {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.len);
        }
    }
}

impl std::fmt::Debug for WriteCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCompletion")
            .field("len", &self.len)
            .field("attached", &self.shared.is_some())
            .finish()
    }
}

/// Writes output into a sink, keeping track of unacknowledged bytes.
pub struct FlowWriter {
    sink: Box<dyn OutputSink>,
    shared: Arc<FlowShared>,
}

impl FlowWriter {
    /// Wrap `sink`. The receiver yields every pause/resume transition.
    #[must_use]
    pub fn new(
        sink: Box<dyn OutputSink>,
        thresholds: FlowThresholds,
    ) -> (Self, mpsc::UnboundedReceiver<FlowControl>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(FlowShared {
            state: Mutex::new(FlowState::new(thresholds)),
            signals,
        });
        (Self { sink, shared }, rx)
    }

    /// Hand a chunk to the sink.
    pub fn write(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        let len = data.len();
        let signal = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(len);
        if let Some(signal) = signal {
            tracing::debug!(?signal, watermark = self.watermark(), "Sink backlog above high watermark");
            let _ = self.shared.signals.send(signal);
        }

        let done = WriteCompletion {
            len,
            shared: Some(Arc::clone(&self.shared)),
        };
        self.sink.write(data, done);
    }

    /// Write local echo. Echo is not counted against the watermark.
    pub fn echo(&mut self, data: &str) {
        if !data.is_empty() {
            self.sink.write(data, WriteCompletion::detached());
        }
    }

    #[must_use]
    pub fn watermark(&self) -> usize {
        self.lock().watermark()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().is_paused()
    }

    pub fn sink_mut(&mut self) -> &mut dyn OutputSink {
        self.sink.as_mut()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlowState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for FlowWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWriter")
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}
