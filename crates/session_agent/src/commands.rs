use session_store::FileOp;

pub const HELP_TEXT: &str = "Commands: /help, /confirm, /cancel, /select <option>, /yolo, /normal, \
/toggle <ls|read|diff>, /continue, /reset, /status, /thought [id], /exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Confirm,
    Cancel,
    Select(String),
    /// Switch to unattended mode.
    Yolo,
    Normal,
    Toggle(FileOp),
    Continue,
    Reset,
    Status,
    Thought(Option<u64>),
    Exit,
    /// Recognized command with unusable arguments; carries the usage hint.
    Usage(&'static str),
    Unknown(String),
}

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let (command, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (trimmed, ""),
    };

    let parsed = match command.to_lowercase().as_str() {
        "/help" => SlashCommand::Help,
        "/confirm" => SlashCommand::Confirm,
        "/cancel" => SlashCommand::Cancel,
        "/select" if rest.is_empty() => SlashCommand::Usage("/select <option>"),
        "/select" => SlashCommand::Select(rest.to_string()),
        "/yolo" => SlashCommand::Yolo,
        "/normal" => SlashCommand::Normal,
        "/toggle" => match FileOp::parse(rest) {
            Some(op) => SlashCommand::Toggle(op),
            None => SlashCommand::Usage("/toggle <ls|read|diff>"),
        },
        "/continue" => SlashCommand::Continue,
        "/reset" => SlashCommand::Reset,
        "/status" => SlashCommand::Status,
        "/thought" if rest.is_empty() => SlashCommand::Thought(None),
        "/thought" => match rest.parse::<u64>() {
            Ok(id) => SlashCommand::Thought(Some(id)),
            Err(_) => SlashCommand::Usage("/thought [message id]"),
        },
        "/exit" | "/quit" => SlashCommand::Exit,
        _ => SlashCommand::Unknown(command.to_string()),
    };

    Some(parsed)
}
