use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use agent_provider::{ChatMessage, RunId};

use crate::schema::{
    FileOp, GenerationStatus, Message, Mode, PendingCommand, Role, ThoughtSnapshot,
};

pub const MAX_HISTORY: usize = 20;
pub const MAX_TOOL_CALL_HISTORY: usize = 10;
pub const MAX_THOUGHT_SNAPSHOTS: usize = 50;

/// Rough token estimate used for diagnostics: one token per four characters.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Conversation state for one user.
///
/// Bounded collections trim oldest-first. A pending command only exists while
/// the status is one of the waiting states.
#[derive(Debug, Clone)]
pub struct Session {
    user_id: String,
    session_id: String,
    mode: Mode,
    history: VecDeque<Message>,
    next_message_id: u64,
    thought_snapshots: BTreeMap<u64, ThoughtSnapshot>,
    tool_call_history: VecDeque<String>,
    tool_success_count: u64,
    tool_failure_count: u64,
    current_chain_tool_count: u32,
    thought_tokens: u64,
    total_thinking_time_ms: u64,
    last_thinking_time_ms: u64,
    status: GenerationStatus,
    pending_command: Option<PendingCommand>,
    last_thought: Option<String>,
    log_file_path: Option<PathBuf>,
    anti_loop_exempted: bool,
    enabled_capabilities: BTreeSet<FileOp>,
    start_time_ms: u64,
    last_activity_ms: u64,
    active_run: Option<RunId>,
    next_run_id: RunId,
}

impl Session {
    #[must_use]
    pub fn new(user_id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            mode: Mode::Normal,
            history: VecDeque::new(),
            next_message_id: 0,
            thought_snapshots: BTreeMap::new(),
            tool_call_history: VecDeque::new(),
            tool_success_count: 0,
            tool_failure_count: 0,
            current_chain_tool_count: 0,
            thought_tokens: 0,
            total_thinking_time_ms: 0,
            last_thinking_time_ms: 0,
            status: GenerationStatus::Idle,
            pending_command: None,
            last_thought: None,
            log_file_path: None,
            anti_loop_exempted: false,
            enabled_capabilities: BTreeSet::new(),
            start_time_ms: now_ms,
            last_activity_ms: now_ms,
            active_run: None,
            next_run_id: 1,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Switches mode. Pending commands are left exactly as they are.
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn append_user(&mut self, content: impl Into<String>) -> u64 {
        self.push_message(Role::User, content.into(), None, None)
    }

    /// Appends an assistant message, recording its reasoning and timing.
    pub fn append_assistant(
        &mut self,
        content: impl Into<String>,
        thought: Option<String>,
        thinking_time_ms: Option<u64>,
    ) -> u64 {
        let thought = thought.filter(|value| !value.trim().is_empty());
        let id = self.push_message(
            Role::Assistant,
            content.into(),
            thought.clone(),
            thinking_time_ms,
        );

        if let Some(ms) = thinking_time_ms {
            self.total_thinking_time_ms = self.total_thinking_time_ms.saturating_add(ms);
            self.last_thinking_time_ms = ms;
        }

        if let Some(thought) = thought {
            self.thought_tokens = self.thought_tokens.saturating_add(estimate_tokens(&thought));
            self.thought_snapshots.insert(
                id,
                ThoughtSnapshot {
                    thought: thought.clone(),
                    thinking_time_ms,
                },
            );
            while self.thought_snapshots.len() > MAX_THOUGHT_SNAPSHOTS {
                self.thought_snapshots.pop_first();
            }
            self.last_thought = Some(thought);
        }

        id
    }

    fn push_message(
        &mut self,
        role: Role,
        content: String,
        thought: Option<String>,
        thinking_time_ms: Option<u64>,
    ) -> u64 {
        let id = self.next_message_id;
        self.next_message_id += 1;
        self.history.push_back(Message {
            id,
            role,
            content,
            thought,
            thinking_time_ms,
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        id
    }

    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.history.iter()
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.history.back()
    }

    #[must_use]
    pub fn find_message(&self, id: u64) -> Option<&Message> {
        self.history.iter().find(|message| message.id == id)
    }

    /// Provider-facing copy of the retained history.
    #[must_use]
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.history.iter().map(Message::to_chat_message).collect()
    }

    #[must_use]
    pub fn estimated_history_tokens(&self) -> u64 {
        self.history
            .iter()
            .map(|message| estimate_tokens(&message.content))
            .sum()
    }

    #[must_use]
    pub fn thought_snapshot(&self, message_id: u64) -> Option<&ThoughtSnapshot> {
        self.thought_snapshots.get(&message_id)
    }

    #[must_use]
    pub fn thought_snapshot_count(&self) -> usize {
        self.thought_snapshots.len()
    }

    #[must_use]
    pub fn last_thought(&self) -> Option<&str> {
        self.last_thought.as_deref()
    }

    pub fn record_tool_call(&mut self, raw: impl Into<String>) {
        self.tool_call_history.push_back(raw.into());
        while self.tool_call_history.len() > MAX_TOOL_CALL_HISTORY {
            self.tool_call_history.pop_front();
        }
    }

    /// Tool-call strings, most recent last.
    #[must_use]
    pub fn tool_call_history(&self) -> Vec<String> {
        self.tool_call_history.iter().cloned().collect()
    }

    pub fn record_tool_success(&mut self) {
        self.tool_success_count += 1;
        self.current_chain_tool_count += 1;
    }

    pub fn record_tool_failure(&mut self) {
        self.tool_failure_count += 1;
        self.current_chain_tool_count += 1;
    }

    pub fn reset_tool_chain(&mut self) {
        self.current_chain_tool_count = 0;
    }

    #[must_use]
    pub fn tool_success_count(&self) -> u64 {
        self.tool_success_count
    }

    #[must_use]
    pub fn tool_failure_count(&self) -> u64 {
        self.tool_failure_count
    }

    #[must_use]
    pub fn current_chain_tool_count(&self) -> u32 {
        self.current_chain_tool_count
    }

    #[must_use]
    pub fn thought_tokens(&self) -> u64 {
        self.thought_tokens
    }

    #[must_use]
    pub fn total_thinking_time_ms(&self) -> u64 {
        self.total_thinking_time_ms
    }

    #[must_use]
    pub fn last_thinking_time_ms(&self) -> u64 {
        self.last_thinking_time_ms
    }

    #[must_use]
    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    /// Moves to `status`. Leaving the waiting states drops any pending command.
    pub fn set_status(&mut self, status: GenerationStatus) {
        self.status = status;
        if !status.is_waiting() {
            self.pending_command = None;
        }
    }

    /// Parks `pending` until the user confirms or cancels.
    pub fn await_confirmation(&mut self, pending: PendingCommand) {
        self.status = GenerationStatus::WaitingConfirm;
        self.pending_command = Some(pending);
    }

    /// Parks a choice prompt until the user selects an option.
    pub fn await_choice(&mut self, options: Vec<String>) {
        self.status = GenerationStatus::WaitingChoice;
        self.pending_command = Some(PendingCommand::choosing(options));
    }

    #[must_use]
    pub fn pending_command(&self) -> Option<&PendingCommand> {
        self.pending_command.as_ref()
    }

    /// Removes the pending command; the caller is responsible for the next status.
    pub fn take_pending(&mut self) -> Option<PendingCommand> {
        self.pending_command.take()
    }

    #[must_use]
    pub fn anti_loop_exempted(&self) -> bool {
        self.anti_loop_exempted
    }

    pub fn set_anti_loop_exempted(&mut self, exempted: bool) {
        self.anti_loop_exempted = exempted;
    }

    #[must_use]
    pub fn is_capability_enabled(&self, capability: FileOp) -> bool {
        self.enabled_capabilities.contains(&capability)
    }

    #[must_use]
    pub fn enabled_capabilities(&self) -> &BTreeSet<FileOp> {
        &self.enabled_capabilities
    }

    pub fn set_capability_enabled(&mut self, capability: FileOp, enabled: bool) {
        if enabled {
            self.enabled_capabilities.insert(capability);
        } else {
            self.enabled_capabilities.remove(&capability);
        }
    }

    #[must_use]
    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file_path.as_deref()
    }

    pub fn set_log_file_path(&mut self, path: Option<PathBuf>) {
        self.log_file_path = path;
    }

    #[must_use]
    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    #[must_use]
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = self.last_activity_ms.max(now_ms);
    }

    /// Returns true when the session has seen no activity for `timeout_ms`.
    #[must_use]
    pub fn is_idle_since(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) >= timeout_ms
    }

    /// Claims the session for a new model round or tool job.
    pub fn begin_run(&mut self) -> RunId {
        let run_id = self.next_run_id;
        self.next_run_id += 1;
        self.active_run = Some(run_id);
        run_id
    }

    #[must_use]
    pub fn active_run(&self) -> Option<RunId> {
        self.active_run
    }

    #[must_use]
    pub fn is_active_run(&self, run_id: RunId) -> bool {
        self.active_run == Some(run_id)
    }

    /// Releases the current run; later results carrying its id become stale.
    pub fn clear_run(&mut self) -> Option<RunId> {
        self.active_run.take()
    }

    /// Clears the conversation, tool history and chain counters.
    pub fn clear_history(&mut self) {
        self.history.clear();
        self.tool_call_history.clear();
        self.current_chain_tool_count = 0;
        self.anti_loop_exempted = false;
    }
}
