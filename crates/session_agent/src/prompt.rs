use std::collections::BTreeSet;

use session_store::{FileOp, Mode};

use crate::tools::ToolRegistry;

pub const SYSTEM_PROMPT_ENV_VAR: &str = "SESSION_AGENT_SYSTEM_PROMPT";
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an assistant operating a live host on behalf of one user. \
Work in small steps, call at most one tool per reply, and stop with #over once the request is handled.";

const TOOL_POLICY: &str = "To call a tool, put it alone on its own line, for example `#run: say hello`. \
Only the first tool line of a reply is used. Tool results come back as `#<tool>_result:` messages.";

/// Base prompt: the env override when set and non-blank, else the configured
/// prompt, else the built-in default.
#[must_use]
pub fn base_prompt_from_env(configured: Option<&str>) -> String {
    let from_env = std::env::var(SYSTEM_PROMPT_ENV_VAR).ok();
    sanitize_prompt(from_env.as_deref())
        .or_else(|| sanitize_prompt(configured))
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
}

fn sanitize_prompt(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Appends the tool policy and the inventory available to this session.
///
/// File tools are listed in normal mode, where every call is confirmed, and
/// in unattended mode only once the capability has been enabled.
#[must_use]
pub fn compose_system_prompt(
    base: &str,
    registry: &ToolRegistry,
    mode: Mode,
    enabled: &BTreeSet<FileOp>,
) -> String {
    let inventory: Vec<String> = registry
        .handlers()
        .filter(|handler| match FileOp::parse(handler.name()) {
            Some(op) => mode == Mode::Normal || enabled.contains(&op),
            None => true,
        })
        .map(|handler| format!("- {}", handler.usage()))
        .collect();

    format!(
        "{base}\n\n{TOOL_POLICY}\n\nMode: {}\nTools:\n{}",
        mode.as_str(),
        inventory.join("\n")
    )
}
