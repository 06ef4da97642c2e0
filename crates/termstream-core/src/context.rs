//! Client identity announced to the coordinator on connect.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::envelope::{Category, CodecError, Outbound};

/// Whether a workspace entry is a single folder or a multi-root workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceKind {
    Folder,
    Workspace,
}

/// Workspace open in the front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub name: String,
    pub path: PathBuf,
    pub kind: WorkspaceKind,
}

impl WorkspaceInfo {
    /// Describe a folder, naming it after its last path component.
    #[must_use]
    pub fn folder(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self {
            name,
            path,
            kind: WorkspaceKind::Folder,
        }
    }
}

/// Handshake payload sent in a `system` event right after the connection opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContext {
    pub client_version: String,
    pub host_version: String,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceInfo>,
    pub platform: String,
}

impl ClientContext {
    /// Context for this build running on the current platform.
    #[must_use]
    pub fn new(host_version: impl Into<String>) -> Self {
        Self {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            host_version: host_version.into(),
            workspaces: Vec::new(),
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// Add a workspace.
    #[must_use]
    pub fn with_workspace(mut self, workspace: WorkspaceInfo) -> Self {
        self.workspaces.push(workspace);
        self
    }

    /// Build the handshake draft.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn handshake(&self) -> Result<Outbound, CodecError> {
        Outbound::event(Category::System, self)
    }
}
