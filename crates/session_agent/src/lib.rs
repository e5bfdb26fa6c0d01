//! Per-user session core for a tool-using chat agent.
//!
//! The [`orchestrator::Orchestrator`] owns one generation state machine per
//! user. Model replies may carry a single `#tool: args` marker, which the
//! [`tools::ToolRegistry`] resolves to a handler. Effectful tools are gated:
//! in normal mode every command waits for the user to confirm it, and in
//! unattended mode file tools stay locked until the user passes a
//! [`verification::VerificationGate`] challenge. The [`anti_loop`] guard halts
//! chains that grow too long or keep repeating the same call.
//!
//! ## Provider bootstrap
//!
//! `SESSION_AGENT_PROVIDER` selects the model gateway. Only `mock` is
//! available in this workspace.
//!
//! ## Configuration
//!
//! `SESSION_AGENT_CONFIG_PATH` points at a JSON file described in [`config`].
//! `SESSION_AGENT_SYSTEM_PROMPT` overrides the base system prompt; the tool
//! policy and the session's tool inventory are appended on every round.
//!
//! ## Threading
//!
//! Work leaves the caller through a [`runtime::Spawner`]. Headless hosts and
//! tests use [`runtime::QueuedSpawner`] and drain it with
//! [`runtime::QueuedSpawner::run_until_idle`].

pub mod anti_loop;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod orchestrator;
pub mod prompt;
pub mod providers;
pub mod runtime;
pub mod tools;
pub mod verification;
