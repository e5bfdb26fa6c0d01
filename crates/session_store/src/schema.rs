use std::fmt;

use agent_provider::{ChatMessage, ChatRole};
use serde::{Deserialize, Serialize};

/// How effectful tool calls are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every effectful tool waits for an explicit confirmation.
    #[default]
    Normal,
    /// Tools run immediately unless a risk rule routes them to confirmation.
    Unattended,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Unattended => "unattended",
        }
    }
}

/// Per-session generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    #[default]
    Idle,
    Thinking,
    ExecutingTool,
    WaitingConfirm,
    WaitingChoice,
    Completed,
    Cancelled,
    Error,
}

impl GenerationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::ExecutingTool => "executing_tool",
            Self::WaitingConfirm => "waiting_confirm",
            Self::WaitingChoice => "waiting_choice",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    /// True while a model round or tool job owns the session.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Thinking | Self::ExecutingTool)
    }

    /// True while the session is parked on a user answer.
    #[must_use]
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::WaitingConfirm | Self::WaitingChoice)
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl From<Role> for ChatRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_time_ms: Option<u64>,
}

impl Message {
    #[must_use]
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.into(),
            content: self.content.clone(),
        }
    }
}

/// Reasoning kept for a message after the message itself may have been trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThoughtSnapshot {
    pub thought: String,
    pub thinking_time_ms: Option<u64>,
}

/// Filesystem tools that must be unlocked per user before unattended use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOp {
    Ls,
    Read,
    Diff,
}

impl FileOp {
    pub const ALL: [FileOp; 3] = [FileOp::Ls, FileOp::Read, FileOp::Diff];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ls => "ls",
            Self::Read => "read",
            Self::Diff => "diff",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ls" => Some(Self::Ls),
            "read" => Some(Self::Read),
            "diff" => Some(Self::Diff),
            _ => None,
        }
    }
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation parked until the user answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
    Run { command: String },
    File { op: FileOp, args: String },
    Choosing { options: Vec<String> },
}

impl PendingAction {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Run { command } => format!("run: {command}"),
            Self::File { op, args } => format!("{op}: {args}"),
            Self::Choosing { options } => format!("choose: {}", options.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub action: PendingAction,
    /// Capability whose challenge must pass before the action may run.
    pub verification: Option<FileOp>,
}

impl PendingCommand {
    #[must_use]
    pub fn confirm(action: PendingAction) -> Self {
        Self {
            action,
            verification: None,
        }
    }

    #[must_use]
    pub fn after_verification(action: PendingAction, capability: FileOp) -> Self {
        Self {
            action,
            verification: Some(capability),
        }
    }

    #[must_use]
    pub fn choosing(options: Vec<String>) -> Self {
        Self::confirm(PendingAction::Choosing { options })
    }

    #[must_use]
    pub fn is_choice(&self) -> bool {
        matches!(self.action, PendingAction::Choosing { .. })
    }
}
