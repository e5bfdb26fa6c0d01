use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use session_agent::collaborators::{Notice, SystemClock, UserNotifier};
use session_agent::commands::{parse_slash_command, SlashCommand, HELP_TEXT};
use session_agent::config::AgentConfig;
use session_agent::host::{shipped_services, FileSecretSink};
use session_agent::orchestrator::{Orchestrator, OrchestratorDeps, SessionStatus};
use session_agent::providers;
use session_agent::runtime::ThreadSpawner;
use session_store::Mode;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOCAL_USER: &str = "local";
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct ConsoleNotifier;

impl UserNotifier for ConsoleNotifier {
    fn notify(&self, _user_id: &str, notice: Notice) {
        let label = match &notice {
            Notice::Assistant(_) => "agent",
            Notice::Info(_) => "info",
            Notice::Prompt(_) => "confirm",
            Notice::Choices(_) => "choose",
            Notice::Error(_) => "error",
        };
        println!("[{label}] {}", notice.text());
    }
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let config = AgentConfig::from_env().map_err(io::Error::other)?;
    let gateway = providers::provider_from_env().map_err(io::Error::other)?;
    let services = shipped_services(&config).map_err(io::Error::other)?;
    let profile = gateway.profile();

    let orchestrator = Orchestrator::new(
        &config,
        OrchestratorDeps {
            gateway,
            services: Arc::new(services),
            notifier: Arc::new(ConsoleNotifier),
            secrets: Arc::new(FileSecretSink::new(&config.verification.secret_dir)),
            clock: Arc::new(SystemClock),
            spawner: Arc::new(ThreadSpawner::new()),
        },
    );
    spawn_idle_sweeper(&orchestrator)?;

    orchestrator
        .start_or_resume(LOCAL_USER)
        .map_err(io::Error::other)?;
    info!(provider = %profile.provider_id, model = %profile.model_id, "session agent ready");
    println!("[info] Connected to {}. {HELP_TEXT}", profile.model_id);

    for line in io::stdin().lock().lines() {
        let line = line?;
        if !orchestrator.sessions().contains(LOCAL_USER) {
            orchestrator
                .start_or_resume(LOCAL_USER)
                .map_err(io::Error::other)?;
        }

        match parse_slash_command(&line) {
            Some(SlashCommand::Exit) => {
                orchestrator.exit(LOCAL_USER);
                break;
            }
            Some(command) => run_command(&orchestrator, command),
            None => {
                orchestrator.submit_user_message(LOCAL_USER, &line);
            }
        }
    }

    Ok(())
}

fn spawn_idle_sweeper(orchestrator: &Arc<Orchestrator>) -> io::Result<()> {
    let orchestrator = Arc::downgrade(orchestrator);
    thread::Builder::new()
        .name("session-agent-idle-sweeper".to_string())
        .spawn(move || loop {
            thread::sleep(IDLE_SWEEP_INTERVAL);
            match orchestrator.upgrade() {
                Some(orchestrator) => {
                    orchestrator.evict_expired();
                }
                None => break,
            }
        })
        .map(|_| ())
}

fn run_command(orchestrator: &Arc<Orchestrator>, command: SlashCommand) {
    let result = match command {
        SlashCommand::Help => {
            println!("[info] {HELP_TEXT}");
            Ok(())
        }
        SlashCommand::Confirm => orchestrator.confirm(LOCAL_USER),
        SlashCommand::Cancel => orchestrator.cancel(LOCAL_USER),
        SlashCommand::Select(choice) => orchestrator.select(LOCAL_USER, &choice),
        SlashCommand::Yolo => orchestrator.switch_mode(LOCAL_USER, Mode::Unattended),
        SlashCommand::Normal => orchestrator.switch_mode(LOCAL_USER, Mode::Normal),
        SlashCommand::Toggle(capability) => orchestrator.toggle_capability(LOCAL_USER, capability),
        SlashCommand::Continue => orchestrator.exempt_anti_loop(LOCAL_USER),
        SlashCommand::Reset => orchestrator.reset(LOCAL_USER),
        SlashCommand::Status => orchestrator
            .status(LOCAL_USER)
            .map(|status| println!("{}", format_status(&status))),
        SlashCommand::Thought(message_id) => {
            orchestrator
                .thought(LOCAL_USER, message_id)
                .map(|snapshot| match snapshot {
                    Some(snapshot) => println!(
                        "[thought] ({}ms) {}",
                        snapshot.thinking_time_ms.unwrap_or_default(),
                        snapshot.thought
                    ),
                    None => println!("[info] No thought recorded"),
                })
        }
        SlashCommand::Exit => {
            orchestrator.exit(LOCAL_USER);
            Ok(())
        }
        SlashCommand::Usage(usage) => {
            println!("[error] Usage: {usage}");
            Ok(())
        }
        SlashCommand::Unknown(command) => {
            println!("[error] Unknown command: {command}. {HELP_TEXT}");
            Ok(())
        }
    };

    if let Err(error) = result {
        println!("[error] {error}");
    }
}

fn format_status(status: &SessionStatus) -> String {
    let capabilities = status
        .enabled_capabilities
        .iter()
        .map(|capability| capability.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "[status] mode={} status={} pending={} messages={} (~{} tokens) tools ok/failed={}/{} chain={} exempt={} thought_tokens={} thinking_ms={} enabled=[{}]",
        status.mode.as_str(),
        status.status,
        status.pending.as_deref().unwrap_or("-"),
        status.history_len,
        status.estimated_history_tokens,
        status.tool_success_count,
        status.tool_failure_count,
        status.current_chain_tool_count,
        status.anti_loop_exempted,
        status.thought_tokens,
        status.total_thinking_time_ms,
        capabilities
    )
}
