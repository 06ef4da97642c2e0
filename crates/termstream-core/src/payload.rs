//! Category-specific payloads carried inside envelopes.

use serde::{Deserialize, Serialize};

use crate::{
    envelope::{Category, CodecError, MessageType, Outbound},
    tail::BufferStats,
};

/// Terminal I/O between a front-end and a per-process endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalMessage {
    /// Keystrokes or an accumulated line, client to server.
    Input { data: String },
    /// Interrupt the foreground process, client to server.
    Interrupt,
    /// Process output, server to client.
    Output { data: String },
    /// Server-side failure, server to client.
    Error { message: String },
}

impl TerminalMessage {
    /// Create an input message.
    #[must_use]
    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }

    /// Wrap into a `terminal` draft.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_outbound(&self) -> Result<Outbound, CodecError> {
        Outbound::event(Category::Terminal, self)
    }
}

/// Terminal lifecycle relays from an editor-side agent to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEvent {
    CommandStart {
        terminal: String,
        command: String,
    },
    CommandEnd {
        terminal: String,
        command: String,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Recent output; carries the buffer tail, not the raw chunk.
    Output {
        terminal: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        output: String,
    },
    /// Error lines collected after a failed command.
    ErrorSummary {
        terminal: String,
        command: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
        errors: Vec<String>,
    },
    /// Final buffer statistics of a closed terminal.
    Closed { terminal: String, stats: BufferStats },
}

impl TerminalEvent {
    /// Wrap into a `terminal` draft.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_outbound(&self) -> Result<Outbound, CodecError> {
        Outbound::event(Category::Terminal, self)
    }
}

/// Upstream backpressure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowControl {
    Pause,
    Resume,
}

impl FlowControl {
    /// Wrap into a `flow` draft.
    #[must_use]
    pub fn to_outbound(self) -> Outbound {
        let payload = match self {
            Self::Pause => serde_json::json!({ "type": "pause" }),
            Self::Resume => serde_json::json!({ "type": "resume" }),
        };
        Outbound::new(MessageType::Event, Category::Flow, payload)
    }
}

/// File system change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    #[serde(rename = "type")]
    pub kind: FileEventKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// Repository state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitEvent {
    pub branch: String,
    pub has_changes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_files: Option<Vec<String>>,
}

/// A single editor diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    #[serde(rename = "type")]
    pub kind: DiagnosticKind,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub severity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Error,
    Warning,
}

/// Activity of an agent CLI running inside a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaudeEvent {
    #[serde(rename = "type")]
    pub kind: ClaudeEventKind,
    pub terminal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AgentState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeEventKind {
    Detected,
    StateChange,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Ready,
    Thinking,
    Executing,
    WaitingPermission,
}

/// Summarized project context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProjectKind,
    pub summary: String,
    pub key_files: Vec<String>,
    pub recent_changes: Vec<String>,
    pub errors: Vec<String>,
    pub token_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectKind {
    Nodejs,
    Python,
    Rust,
    Go,
    Unknown,
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn test_terminal_message_wire_format() {
        let json = serde_json::to_value(TerminalMessage::input("ls -la")).unwrap();
        assert_eq!(json, json!({"type": "input", "data": "ls -la"}));

        let parsed: TerminalMessage =
            serde_json::from_value(json!({"type": "error", "message": "gone"})).unwrap();
        assert_eq!(
            parsed,
            TerminalMessage::Error {
                message: "gone".to_string()
            }
        );
    }

    #[test]
    fn test_command_end_uses_camel_case_exit_code() {
        let event = TerminalEvent::CommandEnd {
            terminal: "bash".to_string(),
            command: "make".to_string(),
            exit_code: Some(2),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "command_end");
        assert_eq!(value["exitCode"], 2);
    }

    #[test]
    fn test_flow_control_draft() {
        let draft = FlowControl::Pause.to_outbound();
        assert_eq!(draft.category, Category::Flow);
        let back: FlowControl = serde_json::from_value(draft.payload).unwrap();
        assert_eq!(back, FlowControl::Pause);
    }

    #[test]
    fn test_git_event_field_names() {
        let value: Value = serde_json::to_value(GitEvent {
            branch: "main".to_string(),
            has_changes: true,
            changed_files: None,
        })
        .unwrap();
        assert_eq!(value, json!({"branch": "main", "hasChanges": true}));
    }
}
