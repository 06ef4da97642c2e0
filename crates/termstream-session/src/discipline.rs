//! Line discipline for remote processes that run without a pseudo-terminal.
//!
//! In raw mode keystrokes go straight to the remote end. In cooked mode the
//! front-end does what a tty would: it echoes locally, edits the current line
//! and only sends complete lines.

use std::str::Chars;

use serde::Deserialize;
use termstream_core::TerminalMessage;

const ENTER: [char; 2] = ['\r', '\n'];
const BACKSPACE: [char; 2] = ['\x7f', '\x08'];
const INTERRUPT: char = '\x03';
const ESCAPE: char = '\x1b';
/// Control sequence of the Delete key, after `ESC [`.
const DELETE: &str = "3~";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisciplineMode {
    /// Forward every keystroke as is.
    Raw,
    /// Local echo and line editing.
    #[default]
    Cooked,
}

/// Result of feeding keystrokes, in the order it must be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send to the remote end.
    Send(TerminalMessage),
    /// Write to the local display.
    Echo(String),
}

#[derive(Debug, Clone, Default)]
pub struct LineDiscipline {
    mode: DisciplineMode,
    current_line: String,
}

impl LineDiscipline {
    #[must_use]
    pub const fn new(mode: DisciplineMode) -> Self {
        Self {
            mode,
            current_line: String::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> DisciplineMode {
        self.mode
    }

    /// Switch mode; a partially typed line is discarded.
    pub fn set_mode(&mut self, mode: DisciplineMode) {
        self.mode = mode;
        self.current_line.clear();
    }

    /// Line typed so far in cooked mode.
    #[must_use]
    pub fn current_line(&self) -> &str {
        &self.current_line
    }

    /// Process keystrokes.
    pub fn feed(&mut self, data: &str) -> Vec<Action> {
        if data.is_empty() {
            return Vec::new();
        }
        match self.mode {
            DisciplineMode::Raw => vec![Action::Send(TerminalMessage::input(data))],
            DisciplineMode::Cooked => self.cook(data),
        }
    }

    fn cook(&mut self, data: &str) -> Vec<Action> {
        let mut actions = Vec::new();

        let mut chars = data.chars();
        while let Some(c) = chars.next() {
            if c == ESCAPE {
                // Arrow keys and other sequences have no meaning without a
                // cursor, except Delete which erases like backspace.
                if skip_escape(&mut chars).as_deref() == Some(DELETE) {
                    self.erase(&mut actions);
                }
            } else if ENTER.contains(&c) {
                echo(&mut actions, "\r\n");
                let line = std::mem::take(&mut self.current_line);
                let data = if line.is_empty() { "\r".to_string() } else { line };
                actions.push(Action::Send(TerminalMessage::Input { data }));
            } else if BACKSPACE.contains(&c) {
                self.erase(&mut actions);
            } else if c == INTERRUPT {
                actions.push(Action::Send(TerminalMessage::Interrupt));
                echo(&mut actions, "^C\r\n");
                self.current_line.clear();
            } else if c == '\t' || !c.is_control() {
                self.current_line.push(c);
                let mut buf = [0; 4];
                echo(&mut actions, c.encode_utf8(&mut buf));
            }
        }

        actions
    }

    fn erase(&mut self, actions: &mut Vec<Action>) {
        if self.current_line.pop().is_some() {
            echo(actions, "\x08 \x08");
        }
    }
}

/// Consume an escape sequence whose `ESC` was already read.
///
/// Returns the parameters and final byte of a CSI sequence (`ESC [ ... F`);
/// SS3 (`ESC O x`) and two-character sequences are consumed and yield `None`.
/// A sequence cut short by the end of the chunk is dropped.
fn skip_escape(chars: &mut Chars<'_>) -> Option<String> {
    match chars.next()? {
        '[' => {
            let mut body = String::new();
            for c in chars.by_ref() {
                body.push(c);
                if ('\x40'..='\x7e').contains(&c) {
                    return Some(body);
                }
            }
            None
        }
        'O' => {
            chars.next();
            None
        }
        _ => None,
    }
}

fn echo(actions: &mut Vec<Action>, text: &str) {
    if let Some(Action::Echo(pending)) = actions.last_mut() {
        pending.push_str(text);
    } else {
        actions.push(Action::Echo(text.to_string()));
    }
}
