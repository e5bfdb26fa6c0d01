//! Shipped implementations of the collaborator traits.

mod memory;
mod search;
mod secrets;
mod shell;
mod tasks;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::collaborators::{Clock, Notice, SearchProvider, UserNotifier};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::tools::{RiskRules, SandboxedFiles, ToolServices};

pub use memory::{InMemoryMemoryStore, MemoryEntry, MAX_MEMORIES};
pub use search::MediaWikiSearch;
pub use secrets::FileSecretSink;
pub use shell::ShellCommandSink;
pub(crate) use shell::truncate_to_byte_limit;
pub use tasks::{InMemoryTaskStore, TaskItem, TaskPriority, TaskStatus};

/// Tool services backed by the shipped collaborators. Search goes to the
/// configured wiki, or is unavailable without one.
pub fn shipped_services(config: &AgentConfig) -> Result<ToolServices, AgentError> {
    let files = SandboxedFiles::new(&config.files.sandbox_root, config.files.read_max_bytes)?;
    let presets = if config.files.preset_root.is_dir() {
        Some(SandboxedFiles::new(
            &config.files.preset_root,
            config.files.read_max_bytes,
        )?)
    } else {
        debug!(path = %config.files.preset_root.display(), "preset directory not found");
        None
    };

    let search: Arc<dyn SearchProvider> = match &config.search.mediawiki_endpoint {
        Some(endpoint) => Arc::new(MediaWikiSearch::new(endpoint.as_str(), &config.search)?),
        None => Arc::new(UnavailableSearch),
    };

    Ok(ToolServices {
        commands: Arc::new(ShellCommandSink::new(files.root(), &config.command)),
        files,
        presets,
        tasks: Arc::new(InMemoryTaskStore::new()),
        memory: Arc::new(InMemoryMemoryStore::new()),
        search,
        risk: RiskRules::new(&config.risk_commands),
    })
}

/// Search backend used when no provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableSearch;

impl SearchProvider for UnavailableSearch {
    fn search(&self, _query: &str) -> Result<String, String> {
        Err("Search is not available on this host".to_string())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.now_ms.fetch_add(secs * 1000, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Notifier that keeps every notice for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(String, Notice)>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn notices_for(&self, user_id: &str) -> Vec<Notice> {
        self.lock()
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, notice)| notice.clone())
            .collect()
    }

    /// Removes and returns everything recorded so far.
    pub fn drain(&self) -> Vec<(String, Notice)> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Notice)>> {
        match self.notices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl UserNotifier for RecordingNotifier {
    fn notify(&self, user_id: &str, notice: Notice) {
        self.lock().push((user_id.to_string(), notice));
    }
}
