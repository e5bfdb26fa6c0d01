//! Seams to everything the session core does not decide for itself.

use std::time::{SystemTime, UNIX_EPOCH};

/// Captured result of a host command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    /// `None` when the host produced no capturable output.
    pub output: Option<String>,
}

/// Executes one host command on behalf of a user.
pub trait CommandSink: Send + Sync {
    fn execute(&self, user_id: &str, command: &str) -> CommandOutcome;
}

/// Structured per-user task list.
pub trait TaskStore: Send + Sync {
    /// Replaces the user's list from a JSON array; returns a result line for the model.
    fn update(&self, user_id: &str, todo_json: &str) -> Result<String, String>;

    fn list(&self, user_id: &str) -> String;
}

/// Per-user remembered facts. Indices are 1-based.
pub trait MemoryStore: Send + Sync {
    fn add(&self, user_id: &str, category: &str, content: &str) -> Result<String, String>;

    fn remove(&self, user_id: &str, index: usize) -> Result<String, String>;

    fn update(
        &self,
        user_id: &str,
        index: usize,
        category: Option<&str>,
        content: &str,
    ) -> Result<String, String>;

    fn clear(&self, user_id: &str) -> String;

    fn list(&self, user_id: &str) -> String;

    fn len(&self, user_id: &str) -> usize;
}

pub trait SearchProvider: Send + Sync {
    fn search(&self, query: &str) -> Result<String, String>;
}

/// User-visible output produced by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Assistant(String),
    Info(String),
    Prompt(String),
    Choices(Vec<String>),
    Error(String),
}

impl Notice {
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Assistant(text) | Self::Info(text) | Self::Prompt(text) | Self::Error(text) => {
                text.clone()
            }
            Self::Choices(options) => options
                .iter()
                .enumerate()
                .map(|(index, option)| format!("{}. {option}", index + 1))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

pub trait UserNotifier: Send + Sync {
    fn notify(&self, user_id: &str, notice: Notice);
}

/// Out-of-band channel for verification secrets.
pub trait SecretSink: Send + Sync {
    /// Delivers `secret`; returns a hint telling the user where to find it.
    fn deliver(&self, user_id: &str, capability: &str, secret: &str) -> Result<String, String>;

    /// Removes a delivered secret once it is no longer valid.
    fn revoke(&self, _user_id: &str, _capability: &str) {}
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}
