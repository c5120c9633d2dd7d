use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of coding agent a session speaks to. Modeled as a tagged variant
/// (not a trait object hierarchy) per the adapter-polymorphism note: three
/// concrete kinds share one contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Opencode,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Opencode => "opencode",
            AgentKind::Codex => "codex",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

/// A named, container-isolated dev environment with a stable ssh port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub container_id: Option<String>,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Host port forwards, keyed by name; always contains at least `ssh`.
    pub ports: BTreeMap<String, u16>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Workspace {
    pub fn container_name(&self) -> String {
        format!("workspace-{}", self.name)
    }

    pub fn ssh_port(&self) -> Option<u16> {
        self.ports.get("ssh").copied()
    }
}

/// Persistent registry record (C3): `ownId` → agent session linkage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub own_id: String,
    pub workspace_name: String,
    pub agent_kind: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_native_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveSessionStatus {
    Idle,
    Running,
    Interrupted,
    Errored,
    Exited,
}

/// A single agent-emitted or system-emitted message (C4/C8), tagged with a
/// monotonic id assigned by the owning `session::Manager`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    User {
        id: u64,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Assistant {
        id: u64,
        content: String,
        timestamp: DateTime<Utc>,
    },
    ToolUse {
        id: u64,
        #[serde(rename = "toolId")]
        tool_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        id: u64,
        #[serde(rename = "toolId")]
        tool_id: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    System {
        id: u64,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        id: u64,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Done {
        id: u64,
        timestamp: DateTime<Utc>,
    },
}

impl Message {
    pub fn id(&self) -> u64 {
        match self {
            Message::User { id, .. }
            | Message::Assistant { id, .. }
            | Message::ToolUse { id, .. }
            | Message::ToolResult { id, .. }
            | Message::System { id, .. }
            | Message::Error { id, .. }
            | Message::Done { id, .. } => *id,
        }
    }

    pub fn with_id(self, id: u64) -> Self {
        match self {
            Message::User { content, timestamp, .. } => Message::User { id, content, timestamp },
            Message::Assistant { content, timestamp, .. } => {
                Message::Assistant { id, content, timestamp }
            }
            Message::ToolUse {
                tool_id,
                tool_name,
                content,
                timestamp,
                ..
            } => Message::ToolUse {
                id,
                tool_id,
                tool_name,
                content,
                timestamp,
            },
            Message::ToolResult {
                tool_id,
                content,
                timestamp,
                ..
            } => Message::ToolResult {
                id,
                tool_id,
                content,
                timestamp,
            },
            Message::System { content, timestamp, .. } => Message::System { id, content, timestamp },
            Message::Error { content, timestamp, .. } => Message::Error { id, content, timestamp },
            Message::Done { timestamp, .. } => Message::Done { id, timestamp },
        }
    }
}

/// Metadata derived from a transcript file without fully parsing it (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub project_path: Option<String>,
    pub message_count: usize,
    pub last_activity: DateTime<Utc>,
    pub first_prompt: Option<String>,
    pub display_name: Option<String>,
}
