//! Tool-call parsing, the handler registry, and the built-in tools.
//!
//! A model reply may carry at most one tool marker: a line beginning with
//! `#name`, followed by `:` or whitespace and the arguments. Dispatch never
//! blocks on I/O; slow work is returned as a [`ToolJob`] for the caller to
//! schedule.

mod builtin;
mod files;
mod risk;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use session_store::{FileOp, Mode, PendingAction, PendingCommand};

use crate::collaborators::{CommandSink, MemoryStore, SearchProvider, TaskStore};

pub use builtin::register_builtin_tools;
pub use files::SandboxedFiles;
pub use risk::RiskRules;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub ok: bool,
    pub content: String,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: content.into(),
        }
    }
}

/// Deferred tool work. Runs off the caller's thread.
pub type ToolJob = Box<dyn FnOnce() -> ToolOutput + Send>;

/// What the orchestrator must do next after a tool call is dispatched.
pub enum ToolOutcome {
    /// The model declared the task done.
    Finished,
    /// The model asked to leave the session.
    Exit,
    /// Result is ready now and becomes feedback for the next round.
    Immediate(ToolOutput),
    /// Result must be produced on a background worker.
    Background(ToolJob),
    AwaitConfirmation(PendingCommand),
    AwaitChoice(Vec<String>),
    /// The action waits for a verification challenge on its capability.
    AwaitVerification(PendingCommand),
}

impl fmt::Debug for ToolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => f.write_str("Finished"),
            Self::Exit => f.write_str("Exit"),
            Self::Immediate(output) => f.debug_tuple("Immediate").field(output).finish(),
            Self::Background(_) => f.write_str("Background(..)"),
            Self::AwaitConfirmation(pending) => {
                f.debug_tuple("AwaitConfirmation").field(pending).finish()
            }
            Self::AwaitChoice(options) => f.debug_tuple("AwaitChoice").field(options).finish(),
            Self::AwaitVerification(pending) => {
                f.debug_tuple("AwaitVerification").field(pending).finish()
            }
        }
    }
}

/// Session facts a handler may consult. Built from a snapshot so no session
/// lock is held while handlers run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub user_id: String,
    pub mode: Mode,
    pub enabled_capabilities: BTreeSet<FileOp>,
    pub freeze_remaining_secs: u64,
}

impl ToolContext {
    #[must_use]
    pub fn new(user_id: impl Into<String>, mode: Mode) -> Self {
        Self {
            user_id: user_id.into(),
            mode,
            enabled_capabilities: BTreeSet::new(),
            freeze_remaining_secs: 0,
        }
    }

    #[must_use]
    pub fn is_enabled(&self, capability: FileOp) -> bool {
        self.enabled_capabilities.contains(&capability)
    }
}

pub trait ToolHandler: Send + Sync {
    /// Bare lowercase name, without the leading `#`.
    fn name(&self) -> &'static str;

    /// One-line usage hint shown in the system prompt.
    fn usage(&self) -> &'static str;

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome;
}

/// Everything the built-in handlers reach outside the session for.
pub struct ToolServices {
    pub files: SandboxedFiles,
    pub presets: Option<SandboxedFiles>,
    pub commands: Arc<dyn CommandSink>,
    pub tasks: Arc<dyn TaskStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub search: Arc<dyn SearchProvider>,
    pub risk: RiskRules,
}

impl ToolServices {
    /// Builds the deferred job for a confirmed or verified action.
    ///
    /// Returns `None` for choice prompts, which never run as jobs.
    #[must_use]
    pub fn job_for(self: &Arc<Self>, user_id: &str, action: &PendingAction) -> Option<ToolJob> {
        match action {
            PendingAction::Run { command } => Some(builtin::run_job(
                Arc::clone(self),
                user_id.to_string(),
                command.clone(),
            )),
            PendingAction::File { op, args } => {
                Some(builtin::file_job(Arc::clone(self), *op, args.clone()))
            }
            PendingAction::Choosing { .. } => None,
        }
    }
}

/// Name-indexed set of handlers. Lookups ignore case and a leading `#`.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler`, replacing any handler already registered under its name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers
            .insert(normalize_name(handler.name()), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(&normalize_name(name)).cloned()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn ToolHandler>> {
        self.handlers.values()
    }

    /// Resolves and invokes the call in `raw`. Unknown names become a failed
    /// result rather than an error so the model can correct itself.
    #[must_use]
    pub fn dispatch(&self, ctx: &ToolContext, raw: &str) -> ToolOutcome {
        let (name, args) = parse_call(raw);
        match self.get(&name) {
            Some(handler) => handler.invoke(ctx, &args),
            None => ToolOutcome::Immediate(ToolOutput::fail(format!(
                "#error: unknown tool {name}. Use one of: {}",
                self.names()
                    .iter()
                    .map(|name| format!("#{name}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_start_matches('#').to_lowercase()
}

/// Splits a raw call at the earlier of the first `:` or space.
///
/// Both halves are trimmed; the name keeps its `#`.
#[must_use]
pub fn parse_call(raw: &str) -> (String, String) {
    let raw = raw.trim();
    match raw.find([':', ' ']) {
        Some(index) => (
            raw[..index].trim().to_string(),
            raw[index + 1..].trim().to_string(),
        ),
        None => (raw.to_string(), String::new()),
    }
}

/// Returns the first line of `text` that starts with a tool marker, trimmed.
///
/// A marker is `#` followed by an ASCII letter and further letters, digits,
/// or underscores, then `:`, whitespace, or the end of the line. Markdown
/// headings (`# Title`) and plain hashtags in prose do not qualify.
#[must_use]
pub fn extract_tool_call(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| is_marker_line(line))
        .map(str::to_string)
}

fn is_marker_line(line: &str) -> bool {
    let Some(rest) = line.strip_prefix('#') else {
        return false;
    };

    let mut chars = rest.chars();
    if !chars.next().is_some_and(|first| first.is_ascii_alphabetic()) {
        return false;
    }

    for ch in chars {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            continue;
        }
        return ch == ':' || ch.is_whitespace();
    }
    true
}
