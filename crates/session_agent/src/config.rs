//! JSON configuration for the session core.
//!
//! Every field has a default, so an empty object (or no file at all) yields a
//! working configuration. Unknown fields are rejected.
//!
//! ```json
//! {
//!   "anti_loop": { "threshold_count": 3, "similarity_threshold": 0.8, "max_chain_count": 10 },
//!   "risk_commands": ["stop", "restart"],
//!   "verification": { "max_attempts": 3, "freeze_secs": 300 },
//!   "files": { "sandbox_root": "/srv/host", "read_max_bytes": 102400 },
//!   "session": { "idle_timeout_minutes": 10, "transcript_dir": "/var/log/agent" },
//!   "search": { "mediawiki_endpoint": "https://minecraft.wiki/api.php", "max_results": 3 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_PATH_ENV_VAR: &str = "SESSION_AGENT_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub anti_loop: AntiLoopConfig,
    /// Case-insensitive command prefixes that always require confirmation.
    pub risk_commands: Vec<String>,
    pub verification: VerificationConfig,
    pub files: FilesConfig,
    pub command: CommandConfig,
    pub session: SessionConfig,
    pub search: SearchConfig,
    /// Replaces the built-in base prompt when set.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            anti_loop: AntiLoopConfig::default(),
            risk_commands: default_risk_commands(),
            verification: VerificationConfig::default(),
            files: FilesConfig::default(),
            command: CommandConfig::default(),
            session: SessionConfig::default(),
            search: SearchConfig::default(),
            system_prompt: None,
        }
    }
}

fn default_risk_commands() -> Vec<String> {
    ["stop", "restart", "reload", "shutdown", "reboot", "kill", "rm", "op", "deop", "ban"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AntiLoopConfig {
    /// How many recent tool calls are compared for near-duplicates.
    pub threshold_count: usize,
    /// Similarity in `0.0..=1.0` at or above which two calls count as repeats.
    pub similarity_threshold: f64,
    /// Tool calls allowed in one chain before it is halted.
    pub max_chain_count: u32,
}

impl Default for AntiLoopConfig {
    fn default() -> Self {
        Self {
            threshold_count: 3,
            similarity_threshold: 0.8,
            max_chain_count: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerificationConfig {
    pub max_attempts: u32,
    pub freeze_secs: u64,
    pub challenge_ttl_secs: u64,
    /// Directory the out-of-band secret files are written to.
    pub secret_dir: PathBuf,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            freeze_secs: 300,
            challenge_ttl_secs: 300,
            secret_dir: PathBuf::from(".verification"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesConfig {
    pub sandbox_root: PathBuf,
    pub preset_root: PathBuf,
    pub read_max_bytes: u64,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from("."),
            preset_root: PathBuf::from("preset"),
            read_max_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandConfig {
    pub timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_output_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub idle_timeout_minutes: u64,
    pub max_sessions: Option<usize>,
    /// When set, every session writes a JSONL transcript below this directory.
    pub transcript_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 10,
            max_sessions: None,
            transcript_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// MediaWiki `api.php` URL. Search is unavailable when unset.
    pub mediawiki_endpoint: Option<String>,
    pub max_results: usize,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            mediawiki_endpoint: None,
            max_results: 3,
            timeout_secs: 10,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes.saturating_mul(60))
    }
}

impl AgentConfig {
    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|error| match error {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from `SESSION_AGENT_CONFIG_PATH`, or returns defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV_VAR)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        match path {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let anti_loop = &self.anti_loop;
        if anti_loop.threshold_count < 2 {
            return Err(ConfigError::invalid(
                "anti_loop.threshold_count",
                "must compare at least 2 calls",
            ));
        }
        if !(anti_loop.similarity_threshold > 0.0 && anti_loop.similarity_threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "anti_loop.similarity_threshold",
                format!("{} is outside (0, 1]", anti_loop.similarity_threshold),
            ));
        }
        if anti_loop.max_chain_count == 0 {
            return Err(ConfigError::invalid("anti_loop.max_chain_count", "must be > 0"));
        }
        if self.verification.max_attempts == 0 {
            return Err(ConfigError::invalid("verification.max_attempts", "must be > 0"));
        }
        if self.verification.freeze_secs == 0 {
            return Err(ConfigError::invalid("verification.freeze_secs", "must be > 0"));
        }
        if self.verification.challenge_ttl_secs == 0 {
            return Err(ConfigError::invalid(
                "verification.challenge_ttl_secs",
                "must be > 0",
            ));
        }
        if self.files.read_max_bytes == 0 {
            return Err(ConfigError::invalid("files.read_max_bytes", "must be > 0"));
        }
        if self.command.timeout_secs == 0 {
            return Err(ConfigError::invalid("command.timeout_secs", "must be > 0"));
        }
        if self.session.max_sessions == Some(0) {
            return Err(ConfigError::invalid("session.max_sessions", "must be > 0"));
        }
        if let Some(endpoint) = &self.search.mediawiki_endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ConfigError::invalid(
                    "search.mediawiki_endpoint",
                    format!("'{endpoint}' is not an http(s) URL"),
                ));
            }
        }
        if self.search.max_results == 0 {
            return Err(ConfigError::invalid("search.max_results", "must be > 0"));
        }
        if self.search.timeout_secs == 0 {
            return Err(ConfigError::invalid("search.timeout_secs", "must be > 0"));
        }
        if self.risk_commands.iter().any(|prefix| prefix.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "risk_commands",
                "entries must not be blank",
            ));
        }

        Ok(())
    }
}
