#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use agent_provider::ModelReply;
use agent_provider_mock::ScriptedGateway;
use session_agent::collaborators::{CommandOutcome, CommandSink, Notice, SecretSink};
use session_agent::config::AgentConfig;
use session_agent::host::{
    InMemoryMemoryStore, InMemoryTaskStore, ManualClock, RecordingNotifier, UnavailableSearch,
};
use session_agent::orchestrator::{Orchestrator, OrchestratorDeps};
use session_agent::runtime::QueuedSpawner;
use session_agent::tools::{RiskRules, SandboxedFiles, ToolServices};
use session_store::{GenerationStatus, Message, Session};

pub const START_MS: u64 = 1_700_000_000_000;

/// Command sink that records what it was asked to run.
#[derive(Default)]
pub struct RecordingCommandSink {
    executed: Mutex<Vec<String>>,
}

impl RecordingCommandSink {
    pub fn executed(&self) -> Vec<String> {
        lock_unpoisoned(&self.executed).clone()
    }
}

impl CommandSink for RecordingCommandSink {
    fn execute(&self, _user_id: &str, command: &str) -> CommandOutcome {
        lock_unpoisoned(&self.executed).push(command.to_string());
        CommandOutcome {
            success: true,
            output: Some(format!("ok: {command}")),
        }
    }
}

/// Secret sink that keeps delivered codes in memory.
#[derive(Default)]
pub struct CapturingSecretSink {
    codes: Mutex<HashMap<String, String>>,
}

impl CapturingSecretSink {
    pub fn code(&self, user_id: &str, capability: &str) -> String {
        lock_unpoisoned(&self.codes)
            .get(&format!("{user_id}/{capability}"))
            .cloned()
            .expect("a code should have been delivered")
    }

    /// A code guaranteed to differ from the delivered one.
    pub fn wrong_code(&self, user_id: &str, capability: &str) -> String {
        if self.code(user_id, capability) == "111111" {
            "222222".to_string()
        } else {
            "111111".to_string()
        }
    }
}

impl SecretSink for CapturingSecretSink {
    fn deliver(&self, user_id: &str, capability: &str, secret: &str) -> Result<String, String> {
        lock_unpoisoned(&self.codes).insert(format!("{user_id}/{capability}"), secret.to_string());
        Ok("The code was printed to the host console".to_string())
    }
}

/// Orchestrator wired to deterministic collaborators.
///
/// Background work is queued; [`Harness::say`] submits a line and drains the
/// queue so each call observes the settled state.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<ScriptedGateway>,
    pub spawner: Arc<QueuedSpawner>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub secrets: Arc<CapturingSecretSink>,
    pub commands: Arc<RecordingCommandSink>,
    pub sandbox: tempfile::TempDir,
}

impl Harness {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self::with_gateway(AgentConfig::default(), ScriptedGateway::new(replies))
    }

    pub fn with_config(config: AgentConfig, replies: Vec<ModelReply>) -> Self {
        Self::with_gateway(config, ScriptedGateway::new(replies))
    }

    pub fn with_gateway(config: AgentConfig, gateway: ScriptedGateway) -> Self {
        let sandbox = tempfile::tempdir().expect("sandbox tempdir");
        fs::write(sandbox.path().join("notes.txt"), "hello").expect("seed notes.txt");

        let gateway = Arc::new(gateway);
        let spawner = Arc::new(QueuedSpawner::new());
        let clock = Arc::new(ManualClock::new(START_MS));
        let notifier = Arc::new(RecordingNotifier::new());
        let secrets = Arc::new(CapturingSecretSink::default());
        let commands = Arc::new(RecordingCommandSink::default());

        let services = test_services(sandbox.path(), &config, commands.clone());

        let orchestrator = Orchestrator::new(
            &config,
            OrchestratorDeps {
                gateway: gateway.clone(),
                services: Arc::new(services),
                notifier: notifier.clone(),
                secrets: secrets.clone(),
                clock: clock.clone(),
                spawner: spawner.clone(),
            },
        );

        Self {
            orchestrator,
            gateway,
            spawner,
            clock,
            notifier,
            secrets,
            commands,
            sandbox,
        }
    }

    pub fn start(&self, user_id: &str) {
        self.orchestrator
            .start_or_resume(user_id)
            .expect("session should start");
    }

    /// Submits `text` and runs all resulting background work.
    pub fn say(&self, user_id: &str, text: &str) -> bool {
        let handled = self.orchestrator.submit_user_message(user_id, text);
        self.spawner.run_until_idle();
        handled
    }

    pub fn drain(&self) -> usize {
        self.spawner.run_until_idle()
    }

    pub fn status(&self, user_id: &str) -> GenerationStatus {
        self.session(user_id, Session::status)
    }

    pub fn session<R>(&self, user_id: &str, read: impl FnOnce(&Session) -> R) -> R {
        self.orchestrator
            .with_session(user_id, read)
            .expect("session should exist")
    }

    pub fn history(&self, user_id: &str) -> Vec<Message> {
        self.session(user_id, |session| session.history().cloned().collect())
    }

    pub fn last_message(&self, user_id: &str) -> Message {
        self.session(user_id, |session| session.last_message().cloned())
            .expect("history should not be empty")
    }

    pub fn notices(&self, user_id: &str) -> Vec<Notice> {
        self.notifier.notices_for(user_id)
    }

    pub fn has_error_notice(&self, user_id: &str, fragment: &str) -> bool {
        self.notices(user_id)
            .iter()
            .any(|notice| matches!(notice, Notice::Error(text) if text.contains(fragment)))
    }

    /// Content of the newest user message the model was sent.
    pub fn last_prompt_to_model(&self) -> String {
        self.gateway
            .requests()
            .last()
            .and_then(|request| request.history.last())
            .map(|message| message.content.clone())
            .expect("the model should have been called")
    }
}

/// Tool services over `root` with in-memory stores and the given command sink.
pub fn test_services(
    root: &Path,
    config: &AgentConfig,
    commands: Arc<dyn CommandSink>,
) -> ToolServices {
    ToolServices {
        files: SandboxedFiles::new(root, config.files.read_max_bytes).expect("sandbox root"),
        presets: None,
        commands,
        tasks: Arc::new(InMemoryTaskStore::new()),
        memory: Arc::new(InMemoryMemoryStore::new()),
        search: Arc::new(UnavailableSearch),
        risk: RiskRules::new(&config.risk_commands),
    }
}

pub fn reply(text: &str) -> ModelReply {
    ModelReply::text(text)
}

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
