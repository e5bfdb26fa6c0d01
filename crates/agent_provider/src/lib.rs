//! Minimal provider-agnostic contract for one model completion round.
//!
//! This crate defines only the request/reply envelope the session core hands
//! to a model and the error surface it expects back. Transport clients and
//! response-format parsing live with the providers that need them.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use thiserror::Error;

/// Identifier for one model round or background tool job.
pub type RunId = u64;

/// Shared cancellation flag for a run.
pub type CancelSignal = Arc<AtomicBool>;

/// Error returned while constructing/configuring a provider before any run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInitError {
    message: String,
}

impl ProviderInitError {
    /// Creates a new provider initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the underlying error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderInitError {}

impl From<String> for ProviderInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Speaker of one history item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Provider-neutral model-facing message history item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Input required for one completion round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub run_id: RunId,
    pub history: Vec<ChatMessage>,
    pub system_prompt: String,
}

/// Parsed model output: visible text plus optional reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelReply {
    pub text: String,
    pub thought: Option<String>,
    pub thinking_time_ms: Option<u64>,
}

impl ModelReply {
    /// Constructs a reply without reasoning metadata.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            thought: None,
            thinking_time_ms: None,
        }
    }

    /// Attaches a reasoning trace and the time spent producing it.
    #[must_use]
    pub fn with_thought(mut self, thought: impl Into<String>, thinking_time_ms: u64) -> Self {
        self.thought = Some(thought.into());
        self.thinking_time_ms = Some(thinking_time_ms);
        self
    }
}

/// Failure surfaced by a gateway for one completion round.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("model transport failed: {0}")]
    Transport(String),
    #[error("model response could not be parsed: {0}")]
    Parse(String),
    #[error("model request was cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Returns true when the caller aborted the round rather than the model failing.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Immutable metadata describing a model gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
    pub thinking_level: Option<String>,
}

/// Gateway interface for executing one completion round.
pub trait ModelGateway: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Runs one completion round and returns the parsed reply.
    ///
    /// Implementations should poll `cancel` between blocking steps and return
    /// [`GatewayError::Cancelled`] once it is set.
    fn complete(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
    ) -> Result<ModelReply, GatewayError>;
}
