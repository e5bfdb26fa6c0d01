//! Per-user generation state machine and the model/tool feedback loop.
//!
//! Every operation locks the user's session only long enough to read or
//! mutate it. Model calls and tool jobs run through the [`Spawner`] and post
//! their results back tagged with the run id that was active when they
//! started; results for any other run are stale and dropped.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use agent_provider::{
    CancelSignal, CompletionRequest, GatewayError, ModelGateway, ModelReply, RunId,
};
use session_store::{
    FileOp, GenerationStatus, Message, Mode, PendingAction, Session, SessionStore,
    SharedSession, ThoughtSnapshot, TranscriptWriter,
};
use tracing::{debug, info, warn};

use crate::anti_loop::{AntiLoopGuard, LoopTrip};
use crate::collaborators::{Clock, Notice, SecretSink, UserNotifier};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::prompt;
use crate::runtime::{lock_unpoisoned, Spawner, Task};
use crate::tools::{
    extract_tool_call, parse_call, register_builtin_tools, ToolContext, ToolJob, ToolOutcome,
    ToolOutput, ToolRegistry, ToolServices,
};
use crate::verification::VerificationGate;

/// Collaborators the orchestrator is built from.
pub struct OrchestratorDeps {
    pub gateway: Arc<dyn ModelGateway>,
    pub services: Arc<ToolServices>,
    pub notifier: Arc<dyn UserNotifier>,
    pub secrets: Arc<dyn SecretSink>,
    pub clock: Arc<dyn Clock>,
    pub spawner: Arc<dyn Spawner>,
}

/// Read-only view of one session for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub user_id: String,
    pub session_id: String,
    pub mode: Mode,
    pub status: GenerationStatus,
    pub pending: Option<String>,
    pub history_len: usize,
    pub estimated_history_tokens: u64,
    pub tool_success_count: u64,
    pub tool_failure_count: u64,
    pub current_chain_tool_count: u32,
    pub thought_tokens: u64,
    pub total_thinking_time_ms: u64,
    pub last_thinking_time_ms: u64,
    pub anti_loop_exempted: bool,
    pub enabled_capabilities: Vec<FileOp>,
}

impl SessionStatus {
    fn from_session(session: &Session) -> Self {
        Self {
            user_id: session.user_id().to_string(),
            session_id: session.session_id().to_string(),
            mode: session.mode(),
            status: session.status(),
            pending: session
                .pending_command()
                .map(|pending| pending.action.describe()),
            history_len: session.history_len(),
            estimated_history_tokens: session.estimated_history_tokens(),
            tool_success_count: session.tool_success_count(),
            tool_failure_count: session.tool_failure_count(),
            current_chain_tool_count: session.current_chain_tool_count(),
            thought_tokens: session.thought_tokens(),
            total_thinking_time_ms: session.total_thinking_time_ms(),
            last_thinking_time_ms: session.last_thinking_time_ms(),
            anti_loop_exempted: session.anti_loop_exempted(),
            enabled_capabilities: session.enabled_capabilities().iter().copied().collect(),
        }
    }
}

/// Lets an external idle timer force a session back to idle without holding
/// the orchestrator alive.
#[derive(Clone)]
pub struct CancelHandle {
    orchestrator: Weak<Orchestrator>,
    user_id: String,
}

impl CancelHandle {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns true when the session existed and was not already idle.
    pub fn force_idle(&self) -> bool {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.force_idle(&self.user_id),
            None => false,
        }
    }
}

pub struct Orchestrator {
    store: SessionStore,
    gateway: Arc<dyn ModelGateway>,
    registry: ToolRegistry,
    services: Arc<ToolServices>,
    gate: VerificationGate,
    anti_loop: AntiLoopGuard,
    notifier: Arc<dyn UserNotifier>,
    clock: Arc<dyn Clock>,
    spawner: Arc<dyn Spawner>,
    base_prompt: String,
    transcript_root: Option<PathBuf>,
    idle_timeout_ms: u64,
    cancel_signals: Mutex<HashMap<String, CancelSignal>>,
}

/// What a locked section decided about the next model round.
enum NextRound {
    Start(CompletionRequest, CancelSignal),
    Halted(LoopTrip),
}

/// A user message appended under the session lock and the round it opened.
struct Continuation {
    message: Option<Message>,
    log_path: Option<PathBuf>,
    next: NextRound,
}

fn parse_confirmation(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" | "confirm" => Some(true),
        "n" | "no" | "cancel" => Some(false),
        _ => None,
    }
}

/// Maps a reply to a choice: a 1-based index, an option name (any case), or
/// the free text itself.
fn resolve_choice(options: &[String], input: &str) -> String {
    let input = input.trim();
    if let Ok(index) = input.parse::<usize>() {
        if let Some(option) = index.checked_sub(1).and_then(|index| options.get(index)) {
            return option.clone();
        }
    }

    options
        .iter()
        .find(|option| option.eq_ignore_ascii_case(input))
        .cloned()
        .unwrap_or_else(|| input.to_string())
}

impl Orchestrator {
    /// Builds an orchestrator with the built-in tool set.
    #[must_use]
    pub fn new(config: &AgentConfig, deps: OrchestratorDeps) -> Arc<Self> {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, &deps.services);
        Self::with_registry(config, deps, registry)
    }

    /// Builds an orchestrator around a caller-assembled registry.
    #[must_use]
    pub fn with_registry(
        config: &AgentConfig,
        deps: OrchestratorDeps,
        registry: ToolRegistry,
    ) -> Arc<Self> {
        let store = match config.session.max_sessions {
            Some(limit) => SessionStore::with_capacity_limit(limit),
            None => SessionStore::new(),
        };
        let gate = VerificationGate::new(
            &config.verification,
            deps.secrets,
            Arc::clone(&deps.notifier),
            Arc::clone(&deps.clock),
        );

        Arc::new(Self {
            store,
            gateway: deps.gateway,
            registry,
            services: deps.services,
            gate,
            anti_loop: AntiLoopGuard::new(config.anti_loop.clone()),
            notifier: deps.notifier,
            clock: deps.clock,
            spawner: deps.spawner,
            base_prompt: prompt::base_prompt_from_env(config.system_prompt.as_deref()),
            transcript_root: config.session.transcript_dir.clone(),
            idle_timeout_ms: u64::try_from(config.session.idle_timeout().as_millis())
                .unwrap_or(u64::MAX),
            cancel_signals: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    #[must_use]
    pub fn verification_gate(&self) -> &VerificationGate {
        &self.gate
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.store
    }

    /// Runs `read` against the user's session, if there is one.
    pub fn with_session<R>(&self, user_id: &str, read: impl FnOnce(&Session) -> R) -> Option<R> {
        let shared = self.store.get(user_id)?;
        let session = lock_unpoisoned(&shared);
        Some(read(&session))
    }

    fn session(&self, user_id: &str) -> Result<SharedSession, AgentError> {
        self.store
            .get(user_id)
            .ok_or_else(|| AgentError::NoSession(user_id.to_string()))
    }

    fn notify(&self, user_id: &str, notice: Notice) {
        self.notifier.notify(user_id, notice);
    }

    /// Creates the user's session if absent. Returns true when it was created.
    pub fn start_or_resume(&self, user_id: &str) -> Result<bool, AgentError> {
        let now = self.clock.now_ms();
        let (shared, created) = self.store.get_or_create(user_id, now)?;
        let mut session = lock_unpoisoned(&shared);
        session.touch(now);
        if !created {
            return Ok(false);
        }

        if let Some(root) = &self.transcript_root {
            match TranscriptWriter::create(root, user_id, session.session_id()) {
                Ok(writer) => session.set_log_file_path(Some(writer.path().to_path_buf())),
                Err(error) => warn!(user = user_id, error = %error, "failed to create transcript"),
            }
        }

        info!(user = user_id, session_id = session.session_id(), "session started");
        Ok(true)
    }

    /// Routes one chat line. Returns false when the user has no session.
    ///
    /// An active verification challenge consumes the line first, then a
    /// pending choice or confirmation; a busy session rejects it; otherwise it
    /// starts a new tool chain.
    pub fn submit_user_message(self: &Arc<Self>, user_id: &str, text: &str) -> bool {
        let Some(shared) = self.store.get(user_id) else {
            return false;
        };
        let status = {
            let mut session = lock_unpoisoned(&shared);
            session.touch(self.clock.now_ms());
            session.status()
        };

        let text = text.trim();
        if text.is_empty() {
            return true;
        }

        if let Some(capability) = self.gate.capability_for_reply(user_id, text) {
            self.gate.respond(user_id, capability, text);
            self.settle_verification(user_id, capability);
            return true;
        }

        let result = match status {
            GenerationStatus::WaitingChoice => self.select(user_id, text),
            GenerationStatus::WaitingConfirm => match parse_confirmation(text) {
                Some(true) => self.confirm(user_id),
                Some(false) => self.cancel(user_id),
                None => {
                    self.remind_pending(user_id);
                    Ok(())
                }
            },
            busy if busy.is_busy() => {
                self.reject_busy(user_id);
                Ok(())
            }
            _ => {
                self.start_chain(user_id, text);
                Ok(())
            }
        };

        if let Err(error) = result {
            self.notify(user_id, Notice::Error(error.to_string()));
        }
        true
    }

    fn remind_pending(&self, user_id: &str) {
        let pending = self.with_session(user_id, |session| {
            session
                .pending_command()
                .map(|pending| pending.action.describe())
        });
        if let Some(Some(description)) = pending {
            self.notify(
                user_id,
                Notice::Prompt(format!(
                    "Waiting for confirmation of `{description}`. Reply y to run it or n to cancel."
                )),
            );
        }
    }

    fn reject_busy(&self, user_id: &str) {
        self.notify(
            user_id,
            Notice::Error(
                "Still working on your previous message; wait for it or /cancel".to_string(),
            ),
        );
    }

    fn start_chain(self: &Arc<Self>, user_id: &str, text: &str) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };

        let continuation = {
            let mut session = lock_unpoisoned(&shared);
            let status = session.status();
            if status.is_busy() || status.is_waiting() {
                drop(session);
                self.reject_busy(user_id);
                return;
            }
            // Only a halted chain carries its count into the next message.
            if status == GenerationStatus::Error {
                if let Some(trip) = self.anti_loop.check(&session) {
                    drop(session);
                    self.report_halt(user_id, &trip);
                    return;
                }
            }
            session.reset_tool_chain();
            session.set_anti_loop_exempted(false);
            self.append_and_open(&mut session, text)
        };

        self.proceed(user_id, continuation);
    }

    /// Appends `text` as a user message and starts a model round.
    pub fn feedback(self: &Arc<Self>, user_id: &str, text: &str) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };

        let continuation = {
            let mut session = lock_unpoisoned(&shared);
            self.append_and_open(&mut session, text)
        };
        self.proceed(user_id, continuation);
    }

    /// Runs the loop check on a locked session and opens a model round when
    /// it passes.
    fn open_round(&self, session: &mut Session) -> NextRound {
        if let Some(trip) = self.anti_loop.check(session) {
            session.clear_run();
            session.set_status(GenerationStatus::Error);
            return NextRound::Halted(trip);
        }

        session.set_status(GenerationStatus::Thinking);
        let run_id = session.begin_run();
        let request = CompletionRequest {
            run_id,
            history: session.chat_history(),
            system_prompt: self.system_prompt_for(session),
        };
        NextRound::Start(request, self.fresh_cancel_signal(session.user_id()))
    }

    fn append_and_open(&self, session: &mut Session, text: &str) -> Continuation {
        session.touch(self.clock.now_ms());
        let id = session.append_user(text);
        Continuation {
            message: session.find_message(id).cloned(),
            log_path: session.log_file_path().map(PathBuf::from),
            next: self.open_round(session),
        }
    }

    fn proceed(self: &Arc<Self>, user_id: &str, continuation: Continuation) {
        log_transcript(user_id, continuation.log_path, continuation.message);
        self.launch(user_id, continuation.next);
    }

    fn report_halt(&self, user_id: &str, trip: &LoopTrip) {
        warn!(user = user_id, reason = %trip, status = "error", "tool chain halted");
        self.notify(
            user_id,
            Notice::Error(format!(
                "Tool chain halted: {trip}. Send /continue to let it proceed or /reset to start over."
            )),
        );
    }

    fn system_prompt_for(&self, session: &Session) -> String {
        prompt::compose_system_prompt(
            &self.base_prompt,
            &self.registry,
            session.mode(),
            session.enabled_capabilities(),
        )
    }

    fn fresh_cancel_signal(&self, user_id: &str) -> CancelSignal {
        let signal: CancelSignal = Arc::new(AtomicBool::new(false));
        lock_unpoisoned(&self.cancel_signals).insert(user_id.to_string(), Arc::clone(&signal));
        signal
    }

    fn signal_cancel(&self, user_id: &str) {
        if let Some(signal) = lock_unpoisoned(&self.cancel_signals).get(user_id) {
            signal.store(true, Ordering::SeqCst);
        }
    }

    fn launch(self: &Arc<Self>, user_id: &str, next: NextRound) {
        let (request, cancel) = match next {
            NextRound::Start(request, cancel) => (request, cancel),
            NextRound::Halted(trip) => {
                self.report_halt(user_id, &trip);
                return;
            }
        };

        let run_id = request.run_id;
        let orchestrator = Arc::clone(self);
        let user = user_id.to_string();
        debug!(user = user_id, run_id, status = "thinking", "model round started");

        let task: Task = Box::new(move || {
            let result = orchestrator.gateway.complete(request, cancel);
            orchestrator.finish_model_round(&user, run_id, result);
        });
        if let Err(error) = self.spawner.spawn("model", task) {
            self.fail_run(user_id, run_id, &AgentError::Spawn(error));
        }
    }

    fn fail_run(&self, user_id: &str, run_id: RunId, error: &AgentError) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };
        {
            let mut session = lock_unpoisoned(&shared);
            if !session.is_active_run(run_id) {
                return;
            }
            session.clear_run();
            session.set_status(GenerationStatus::Error);
        }
        warn!(user = user_id, run_id, error = %error, status = "error", "run failed");
        self.notify(user_id, Notice::Error(error.to_string()));
    }

    fn finish_model_round(
        self: &Arc<Self>,
        user_id: &str,
        run_id: RunId,
        result: Result<ModelReply, GatewayError>,
    ) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };

        let reply = {
            let mut session = lock_unpoisoned(&shared);
            if !session.is_active_run(run_id) {
                debug!(user = user_id, run_id, "dropping stale model reply");
                return;
            }
            session.clear_run();
            match result {
                Ok(reply) => reply,
                Err(error) if error.is_cancelled() => {
                    session.set_status(GenerationStatus::Idle);
                    return;
                }
                Err(error) => {
                    session.set_status(GenerationStatus::Error);
                    drop(session);
                    let error = AgentError::Transport(error.to_string());
                    warn!(user = user_id, run_id, error = %error, status = "error", "model round failed");
                    self.notify(user_id, Notice::Error(error.to_string()));
                    return;
                }
            }
        };

        self.apply_model_response(user_id, &reply.text, reply.thought, reply.thinking_time_ms);
    }

    /// Stores a model reply and acts on its first tool marker, if any.
    ///
    /// Returns false when the user has no session.
    pub fn apply_model_response(
        self: &Arc<Self>,
        user_id: &str,
        text: &str,
        thought: Option<String>,
        thinking_time_ms: Option<u64>,
    ) -> bool {
        let Some(shared) = self.store.get(user_id) else {
            return false;
        };

        let tool_call = extract_tool_call(text);
        let (message, log_path, dispatch_run) = {
            let mut session = lock_unpoisoned(&shared);
            session.clear_run();
            session.touch(self.clock.now_ms());
            let id = session.append_assistant(text, thought, thinking_time_ms);
            let dispatch_run = match &tool_call {
                Some(call) => {
                    session.record_tool_call(call.clone());
                    Some(session.begin_run())
                }
                None => {
                    session.set_status(GenerationStatus::Idle);
                    None
                }
            };
            (
                session.find_message(id).cloned(),
                session.log_file_path().map(PathBuf::from),
                dispatch_run,
            )
        };

        log_transcript(user_id, log_path, message);
        if !text.trim().is_empty() {
            self.notify(user_id, Notice::Assistant(text.to_string()));
        }

        if let (Some(call), Some(run_id)) = (tool_call, dispatch_run) {
            self.dispatch_tool(user_id, run_id, &call);
        }
        true
    }

    /// Acts on the reply's tool call unless `run_id` was cancelled since the
    /// reply was stored.
    fn dispatch_tool(self: &Arc<Self>, user_id: &str, run_id: RunId, raw_call: &str) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };
        let freeze_remaining_secs = self.gate.remaining_freeze_seconds(user_id);
        let (tool, _) = parse_call(raw_call);

        let mut session = lock_unpoisoned(&shared);
        if !session.is_active_run(run_id) {
            debug!(user = user_id, run_id, tool = %tool, "dropping tool call from a cancelled round");
            return;
        }
        session.clear_run();
        let ctx = ToolContext {
            user_id: user_id.to_string(),
            mode: session.mode(),
            enabled_capabilities: session.enabled_capabilities().clone(),
            freeze_remaining_secs,
        };
        let outcome = self.registry.dispatch(&ctx, raw_call);
        debug!(user = user_id, tool = %tool, outcome = ?outcome, "tool dispatched");

        match outcome {
            ToolOutcome::Finished => {
                session.record_tool_success();
                session.set_status(GenerationStatus::Completed);
                session.set_status(GenerationStatus::Idle);
                drop(session);
                info!(user = user_id, status = "idle", "chain completed");
            }
            ToolOutcome::Exit => {
                session.record_tool_success();
                drop(session);
                self.exit(user_id);
            }
            ToolOutcome::Immediate(output) => {
                session.set_status(GenerationStatus::ExecutingTool);
                record_output(&mut session, &output);
                let continuation = self.append_and_open(&mut session, &output.content);
                drop(session);
                self.proceed(user_id, continuation);
            }
            ToolOutcome::Background(job) => {
                session.set_status(GenerationStatus::ExecutingTool);
                let run_id = session.begin_run();
                drop(session);
                self.spawn_tool_job(user_id, run_id, tool, job);
            }
            ToolOutcome::AwaitConfirmation(pending) => {
                let description = pending.action.describe();
                session.await_confirmation(pending);
                drop(session);
                info!(user = user_id, tool = %tool, status = "waiting_confirm", "awaiting confirmation");
                self.notify(
                    user_id,
                    Notice::Prompt(format!(
                        "The agent wants to {description}. Reply y to allow or n to cancel."
                    )),
                );
            }
            ToolOutcome::AwaitChoice(options) => {
                session.await_choice(options.clone());
                drop(session);
                info!(user = user_id, status = "waiting_choice", "awaiting choice");
                self.notify(user_id, Notice::Choices(options));
            }
            ToolOutcome::AwaitVerification(pending) => {
                let verification = pending.verification;
                session.await_confirmation(pending);
                drop(session);
                let Some(capability) = verification else {
                    return;
                };
                if let Err(error) = self.start_verification(user_id, capability) {
                    self.abandon_verification(
                        user_id,
                        capability,
                        &format!("#{capability}_result: error - {error}"),
                    );
                }
            }
        }
    }

    fn spawn_tool_job(self: &Arc<Self>, user_id: &str, run_id: RunId, tool: String, job: ToolJob) {
        let orchestrator = Arc::clone(self);
        let user = user_id.to_string();
        debug!(user = user_id, run_id, tool = %tool, status = "executing_tool", "tool job scheduled");

        let task: Task = Box::new(move || {
            let output = job();
            orchestrator.finish_tool(&user, run_id, &tool, output);
        });
        if let Err(error) = self.spawner.spawn("tool", task) {
            self.fail_run(user_id, run_id, &AgentError::Spawn(error));
        }
    }

    fn finish_tool(self: &Arc<Self>, user_id: &str, run_id: RunId, tool: &str, output: ToolOutput) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };
        let continuation = {
            let mut session = lock_unpoisoned(&shared);
            if !session.is_active_run(run_id) {
                debug!(user = user_id, run_id, tool, "dropping stale tool result");
                return;
            }
            session.clear_run();
            record_output(&mut session, &output);
            self.append_and_open(&mut session, &output.content)
        };
        info!(user = user_id, run_id, tool, ok = output.ok, "tool finished");
        self.proceed(user_id, continuation);
    }

    fn start_verification(
        self: &Arc<Self>,
        user_id: &str,
        capability: FileOp,
    ) -> Result<(), AgentError> {
        let orchestrator = Arc::downgrade(self);
        let user = user_id.to_string();
        self.gate.start_challenge(
            user_id,
            capability,
            Box::new(move || {
                if let Some(orchestrator) = orchestrator.upgrade() {
                    orchestrator.on_verified(&user, capability);
                }
            }),
        )?;
        Ok(())
    }

    /// Enables `capability` and runs the action that was waiting on it.
    fn on_verified(self: &Arc<Self>, user_id: &str, capability: FileOp) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };

        let waiting = {
            let mut session = lock_unpoisoned(&shared);
            session.set_capability_enabled(capability, true);
            let waiting_on_this = session.status() == GenerationStatus::WaitingConfirm
                && session
                    .pending_command()
                    .is_some_and(|pending| pending.verification == Some(capability));
            if waiting_on_this {
                let pending = session.take_pending();
                session.set_status(GenerationStatus::ExecutingTool);
                pending.map(|pending| (pending, session.begin_run()))
            } else {
                None
            }
        };

        info!(user = user_id, capability = %capability, "capability enabled");

        if let Some((pending, run_id)) = waiting {
            match self.services.job_for(user_id, &pending.action) {
                Some(job) => self.spawn_tool_job(user_id, run_id, capability.to_string(), job),
                None => self.fail_run(
                    user_id,
                    run_id,
                    &AgentError::validation("verified action has nothing to run"),
                ),
            }
        }
    }

    /// After an attempt that did not verify, drops the parked action once no
    /// challenge remains for it (expired or frozen).
    fn settle_verification(self: &Arc<Self>, user_id: &str, capability: FileOp) {
        if self.gate.is_challenged(user_id, capability) {
            return;
        }
        let remaining = self.gate.remaining_freeze_seconds(user_id);
        let reason = if remaining > 0 {
            format!("#{capability}_result: error - verification failed; frozen for {remaining}s")
        } else {
            format!("#{capability}_result: error - verification expired")
        };
        self.abandon_verification(user_id, capability, &reason);
    }

    fn abandon_verification(self: &Arc<Self>, user_id: &str, capability: FileOp, reason: &str) {
        let Some(shared) = self.store.get(user_id) else {
            return;
        };
        let continuation = {
            let mut session = lock_unpoisoned(&shared);
            let parked = session.status() == GenerationStatus::WaitingConfirm
                && session
                    .pending_command()
                    .is_some_and(|pending| pending.verification == Some(capability));
            if !parked {
                return;
            }
            session.take_pending();
            session.set_status(GenerationStatus::ExecutingTool);
            session.record_tool_failure();
            self.append_and_open(&mut session, reason)
        };
        warn!(user = user_id, capability = %capability, "verification abandoned");
        self.proceed(user_id, continuation);
    }

    /// Runs the command waiting for confirmation.
    pub fn confirm(self: &Arc<Self>, user_id: &str) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        let (description, job, run_id) = {
            let mut session = lock_unpoisoned(&shared);
            session.touch(self.clock.now_ms());
            let pending = match session.pending_command() {
                Some(pending) if session.status() == GenerationStatus::WaitingConfirm => pending,
                _ => return Err(AgentError::validation("Nothing is waiting for confirmation")),
            };
            if let Some(capability) = pending.verification {
                return Err(AgentError::Security(format!(
                    "enter the verification code for #{capability} first"
                )));
            }
            let Some(job) = self.services.job_for(user_id, &pending.action) else {
                return Err(AgentError::validation("The pending action cannot be confirmed"));
            };
            let description = pending.action.describe();
            session.take_pending();
            session.set_status(GenerationStatus::ExecutingTool);
            (description, job, session.begin_run())
        };

        info!(user = user_id, run_id, action = %description, "confirmed");
        self.notify(user_id, Notice::Info(format!("Running {description}")));
        let tool = description
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        self.spawn_tool_job(user_id, run_id, tool, job);
        Ok(())
    }

    /// Discards the pending command or stops the in-flight round.
    ///
    /// The model sees a cancellation note in history; no new round starts.
    pub fn cancel(&self, user_id: &str) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        let (note, abandoned_challenge, message, log_path) = {
            let mut session = lock_unpoisoned(&shared);
            session.touch(self.clock.now_ms());
            let status = session.status();
            let (note, abandoned_challenge) = if status.is_waiting() {
                let pending = session.take_pending();
                let description = pending
                    .as_ref()
                    .map(|pending| pending.action.describe())
                    .unwrap_or_default();
                (
                    format!("#cancelled: the user declined `{description}`"),
                    pending.and_then(|pending| pending.verification),
                )
            } else if status.is_busy() {
                session.clear_run();
                ("#cancelled: the user stopped the current step".to_string(), None)
            } else {
                return Err(AgentError::validation("Nothing to cancel"));
            };

            let id = session.append_user(note.clone());
            session.set_status(GenerationStatus::Cancelled);
            session.set_status(GenerationStatus::Idle);
            (
                note,
                abandoned_challenge,
                session.find_message(id).cloned(),
                session.log_file_path().map(PathBuf::from),
            )
        };

        self.signal_cancel(user_id);
        if let Some(capability) = abandoned_challenge {
            self.gate.cancel(user_id, capability);
        }
        log_transcript(user_id, log_path, message);
        info!(user = user_id, status = "idle", note = %note, "cancelled");
        self.notify(user_id, Notice::Info("Cancelled.".to_string()));
        Ok(())
    }

    /// Answers a pending choice; the chosen option becomes the next user message.
    pub fn select(self: &Arc<Self>, user_id: &str, choice: &str) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        let (selection, continuation) = {
            let mut session = lock_unpoisoned(&shared);
            session.touch(self.clock.now_ms());
            let options = match session.pending_command().map(|pending| &pending.action) {
                Some(PendingAction::Choosing { options })
                    if session.status() == GenerationStatus::WaitingChoice =>
                {
                    options.clone()
                }
                _ => return Err(AgentError::validation("Nothing is waiting for a choice")),
            };
            let selection = resolve_choice(&options, choice);
            if selection.is_empty() {
                return Err(AgentError::validation("Choose one of the listed options"));
            }
            session.take_pending();
            session.record_tool_success();
            session.set_status(GenerationStatus::ExecutingTool);
            let continuation = self.append_and_open(&mut session, &selection);
            (selection, continuation)
        };

        info!(user = user_id, selection = %selection, "choice submitted");
        self.proceed(user_id, continuation);
        Ok(())
    }

    /// Switches between normal and unattended mode. A pending command is kept.
    pub fn switch_mode(&self, user_id: &str, mode: Mode) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        lock_unpoisoned(&shared).set_mode(mode);
        info!(user = user_id, mode = mode.as_str(), "mode switched");
        self.notify(user_id, Notice::Info(format!("Mode is now {}", mode.as_str())));
        Ok(())
    }

    /// Exempts the current chain from loop detection and resumes it when it
    /// was halted.
    pub fn exempt_anti_loop(self: &Arc<Self>, user_id: &str) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        let resumed = {
            let mut session = lock_unpoisoned(&shared);
            session.set_anti_loop_exempted(true);
            if session.status() == GenerationStatus::Error {
                Some(self.open_round(&mut session))
            } else {
                None
            }
        };

        info!(user = user_id, resumed = resumed.is_some(), "anti-loop exemption granted");
        match resumed {
            Some(next) => self.launch(user_id, next),
            None => self.notify(
                user_id,
                Notice::Info("Loop detection is off for this chain".to_string()),
            ),
        }
        Ok(())
    }

    /// Clears the conversation and returns to idle. Enabled capabilities and
    /// the mode are kept.
    pub fn reset(&self, user_id: &str) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        let abandoned_challenge = {
            let mut session = lock_unpoisoned(&shared);
            let challenge = session.pending_command().and_then(|pending| pending.verification);
            session.clear_run();
            session.clear_history();
            session.set_status(GenerationStatus::Idle);
            challenge
        };

        self.signal_cancel(user_id);
        if let Some(capability) = abandoned_challenge {
            self.gate.cancel(user_id, capability);
        }
        info!(user = user_id, status = "idle", "session reset");
        self.notify(user_id, Notice::Info("Conversation cleared".to_string()));
        Ok(())
    }

    /// Tears the session down. Returns false when there was none.
    ///
    /// A verification freeze outlives the session.
    pub fn exit(&self, user_id: &str) -> bool {
        self.signal_cancel(user_id);
        let Some(shared) = self.store.remove(user_id) else {
            return false;
        };
        lock_unpoisoned(&shared).clear_run();
        lock_unpoisoned(&self.cancel_signals).remove(user_id);
        self.gate.clear_user(user_id);
        info!(user = user_id, "session ended");
        self.notify(user_id, Notice::Info("Session ended".to_string()));
        true
    }

    /// Disables an enabled file capability, or starts the challenge that
    /// enables it.
    pub fn toggle_capability(
        self: &Arc<Self>,
        user_id: &str,
        capability: FileOp,
    ) -> Result<(), AgentError> {
        let shared = self.session(user_id)?;
        {
            let mut session = lock_unpoisoned(&shared);
            if session.is_capability_enabled(capability) {
                session.set_capability_enabled(capability, false);
                drop(session);
                info!(user = user_id, capability = %capability, "capability disabled");
                self.notify(
                    user_id,
                    Notice::Info(format!("#{capability} is disabled")),
                );
                return Ok(());
            }
        }
        self.start_verification(user_id, capability)
    }

    /// Thought recorded for `message_id`, or the most recent one.
    pub fn thought(
        &self,
        user_id: &str,
        message_id: Option<u64>,
    ) -> Result<Option<ThoughtSnapshot>, AgentError> {
        let shared = self.session(user_id)?;
        let session = lock_unpoisoned(&shared);
        Ok(match message_id {
            Some(id) => session.thought_snapshot(id).cloned(),
            None => session.last_thought().map(|thought| ThoughtSnapshot {
                thought: thought.to_string(),
                thinking_time_ms: Some(session.last_thinking_time_ms()),
            }),
        })
    }

    pub fn status(&self, user_id: &str) -> Result<SessionStatus, AgentError> {
        let shared = self.session(user_id)?;
        let session = lock_unpoisoned(&shared);
        Ok(SessionStatus::from_session(&session))
    }

    #[must_use]
    pub fn cancel_handle(self: &Arc<Self>, user_id: &str) -> CancelHandle {
        CancelHandle {
            orchestrator: Arc::downgrade(self),
            user_id: user_id.to_string(),
        }
    }

    /// Forces the session back to idle from any waiting or in-flight state.
    pub fn force_idle(&self, user_id: &str) -> bool {
        let Some(shared) = self.store.get(user_id) else {
            return false;
        };
        let abandoned_challenge = {
            let mut session = lock_unpoisoned(&shared);
            if session.status() == GenerationStatus::Idle {
                return false;
            }
            let challenge = session.pending_command().and_then(|pending| pending.verification);
            session.clear_run();
            session.set_status(GenerationStatus::Idle);
            challenge
        };

        self.signal_cancel(user_id);
        if let Some(capability) = abandoned_challenge {
            self.gate.cancel(user_id, capability);
        }
        info!(user = user_id, status = "idle", "session forced idle");
        self.notify(
            user_id,
            Notice::Info("No answer received; the pending step was dropped".to_string()),
        );
        true
    }

    /// Removes sessions idle for at least `timeout_ms` and returns their users.
    pub fn evict_idle(&self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let evicted = self.store.evict_idle(now_ms, timeout_ms);
        for user_id in &evicted {
            self.signal_cancel(user_id);
            lock_unpoisoned(&self.cancel_signals).remove(user_id);
            self.gate.clear_user(user_id);
            info!(user = %user_id, "idle session evicted");
        }
        evicted
    }

    /// [`Orchestrator::evict_idle`] with the current time and configured timeout.
    pub fn evict_expired(&self) -> Vec<String> {
        self.evict_idle(self.clock.now_ms(), self.idle_timeout_ms)
    }
}

fn record_output(session: &mut Session, output: &ToolOutput) {
    if output.ok {
        session.record_tool_success();
    } else {
        session.record_tool_failure();
    }
}

fn log_transcript(user_id: &str, log_path: Option<PathBuf>, message: Option<Message>) {
    let (Some(path), Some(message)) = (log_path, message) else {
        return;
    };
    if let Err(error) = TranscriptWriter::at(path).append(&message) {
        warn!(user = user_id, error = %error, "failed to append transcript entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_words_are_case_insensitive() {
        assert_eq!(parse_confirmation(" Yes "), Some(true));
        assert_eq!(parse_confirmation("CONFIRM"), Some(true));
        assert_eq!(parse_confirmation("n"), Some(false));
        assert_eq!(parse_confirmation("cancel"), Some(false));
        assert_eq!(parse_confirmation("maybe"), None);
    }

    #[test]
    fn choice_resolves_index_name_or_free_text() {
        let options = vec!["A".to_string(), "Beta".to_string(), "C".to_string()];

        assert_eq!(resolve_choice(&options, "2"), "Beta");
        assert_eq!(resolve_choice(&options, "beta"), "Beta");
        assert_eq!(resolve_choice(&options, "B"), "B");
        assert_eq!(resolve_choice(&options, "9"), "9");
        assert_eq!(resolve_choice(&options, "0"), "0");
    }
}
