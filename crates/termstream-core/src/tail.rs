//! Bounded recent-output store.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Default number of retained lines.
pub const DEFAULT_MAX_LINES: usize = 100;

const ERROR_MARKERS: [&str; 5] = ["error", "exception", "fail", "fatal", "critical"];

/// Buffer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub lines_buffered: usize,
    pub total_received: u64,
    pub errors: usize,
}

/// Keeps the last `max_lines` lines of a terminal's output.
///
/// `total_received` counts every line ever appended and only goes back
/// to zero on [`TailBuffer::clear`].
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    total_received: u64,
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

impl TailBuffer {
    /// Create a buffer holding at most `max_lines` lines (at least one).
    #[must_use]
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            max_lines,
            total_received: 0,
        }
    }

    /// Append a chunk that may span several lines.
    ///
    /// Every `\n`-separated piece counts as a line, including a trailing
    /// empty one.
    pub fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }

        for line in chunk.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            self.lines.push_back(line.to_owned());
            self.total_received = self.total_received.saturating_add(1);
        }

        let excess = self.lines.len().saturating_sub(self.max_lines);
        self.lines.drain(..excess);
    }

    /// The final `min(count, len)` lines, oldest first.
    #[must_use]
    pub fn last_lines(&self, count: usize) -> Vec<&str> {
        let start = self.lines.len().saturating_sub(count);
        self.lines.range(start..).map(String::as_str).collect()
    }

    /// Retained lines joined by `\n`.
    #[must_use]
    pub fn content(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Retained lines that look like failures.
    #[must_use]
    pub fn errors(&self) -> Vec<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .filter(|line| is_error_line(line))
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            lines_buffered: self.lines.len(),
            total_received: self.total_received,
            errors: self.lines.iter().filter(|line| is_error_line(line)).count(),
        }
    }

    /// Drop all lines and reset the received counter.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.total_received = 0;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    #[must_use]
    pub const fn max_lines(&self) -> usize {
        self.max_lines
    }

    #[must_use]
    pub const fn total_received(&self) -> u64 {
        self.total_received
    }
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest_but_keeps_total() {
        let mut buffer = TailBuffer::new(3);
        buffer.append("a\nb\nc\nd");
        assert_eq!(buffer.last_lines(10), vec!["b", "c", "d"]);
        assert_eq!(buffer.total_received(), 4);

        buffer.append("e");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_received(), 5);
        assert_eq!(buffer.content(), "c\nd\ne");
    }

    #[test]
    fn test_errors_case_insensitive() {
        let mut buffer = TailBuffer::default();
        buffer.append("build failed\nok\nException: x");
        assert_eq!(buffer.errors(), vec!["build failed", "Exception: x"]);
        assert_eq!(buffer.stats().errors, 2);

        buffer.append("FATAL: disk\nwarning only");
        assert_eq!(buffer.errors().len(), 3);
    }

    #[test]
    fn test_last_lines_bounds() {
        let mut buffer = TailBuffer::new(5);
        buffer.append("1\n2\n3");
        assert_eq!(buffer.last_lines(2), vec!["2", "3"]);
        assert!(buffer.last_lines(0).is_empty());
        assert_eq!(buffer.last_lines(100).len(), 3);
    }

    #[test]
    fn test_crlf_and_empty_chunks() {
        let mut buffer = TailBuffer::new(10);
        buffer.append("");
        assert_eq!(buffer.total_received(), 0);

        buffer.append("one\r\ntwo\r\n");
        assert_eq!(buffer.last_lines(3), vec!["one", "two", ""]);
        assert_eq!(buffer.total_received(), 3);
    }

    #[test]
    fn test_clear_is_repeatable() {
        let mut buffer = TailBuffer::new(2);
        buffer.append("x\ny\nz");
        buffer.clear();
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(
            buffer.stats(),
            BufferStats {
                lines_buffered: 0,
                total_received: 0,
                errors: 0
            }
        );
    }
}
