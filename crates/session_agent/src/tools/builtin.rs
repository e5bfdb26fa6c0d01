use std::sync::Arc;

use session_store::{FileOp, Mode, PendingAction, PendingCommand};
use tracing::debug;

use super::{ToolContext, ToolHandler, ToolJob, ToolOutcome, ToolOutput, ToolRegistry, ToolServices};

/// Registers the built-in tool set, sharing `services` between handlers.
pub fn register_builtin_tools(registry: &mut ToolRegistry, services: &Arc<ToolServices>) {
    registry.register(Arc::new(CompletionMarker { name: "over" }));
    registry.register(Arc::new(CompletionMarker { name: "complete" }));
    registry.register(Arc::new(ExitMarker));
    registry.register(Arc::new(RunTool {
        services: Arc::clone(services),
    }));
    for op in FileOp::ALL {
        registry.register(Arc::new(FileTool {
            op,
            services: Arc::clone(services),
        }));
    }
    registry.register(Arc::new(GetPresetTool {
        services: Arc::clone(services),
    }));
    registry.register(Arc::new(ChooseTool));
    registry.register(Arc::new(SearchTool {
        services: Arc::clone(services),
    }));
    registry.register(Arc::new(TodoTool {
        services: Arc::clone(services),
    }));
    registry.register(Arc::new(RememberTool {
        services: Arc::clone(services),
    }));
    registry.register(Arc::new(ForgetTool {
        services: Arc::clone(services),
    }));
    registry.register(Arc::new(EditMemTool {
        services: Arc::clone(services),
    }));
}

pub(super) fn run_job(services: Arc<ToolServices>, user_id: String, command: String) -> ToolJob {
    Box::new(move || {
        debug!(user = %user_id, command = %command, "executing host command");
        let outcome = services.commands.execute(&user_id, &command);
        match outcome.output {
            Some(output) if outcome.success => ToolOutput::ok(format!("#run_result: {output}")),
            Some(output) => ToolOutput::fail(format!("#run_result: {output}")),
            None if outcome.success => ToolOutput::ok(
                "#run_result: the command ran but produced no output; its effect is unknown",
            ),
            None => ToolOutput::fail("#run_result: the command failed without output"),
        }
    })
}

pub(super) fn file_job(services: Arc<ToolServices>, op: FileOp, args: String) -> ToolJob {
    Box::new(move || {
        let result = match op {
            FileOp::Ls => services.files.list(&args),
            FileOp::Read => services.files.read(&args),
            FileOp::Diff => services.files.diff(&args),
        };
        match result {
            Ok(content) => ToolOutput::ok(format!("#{op}_result: {content}")),
            Err(error) => ToolOutput::fail(format!("#{op}_result: error - {error}")),
        }
    })
}

fn usage_error(usage: &str) -> ToolOutcome {
    ToolOutcome::Immediate(ToolOutput::fail(format!("#error: usage is {usage}")))
}

fn reported(prefix: &str, result: Result<String, String>) -> ToolOutcome {
    ToolOutcome::Immediate(match result {
        Ok(text) => ToolOutput::ok(format!("#{prefix}_result: {text}")),
        Err(error) => ToolOutput::fail(format!("#{prefix}_result: error - {error}")),
    })
}

struct CompletionMarker {
    name: &'static str,
}

impl ToolHandler for CompletionMarker {
    fn name(&self) -> &'static str {
        self.name
    }

    fn usage(&self) -> &'static str {
        if self.name == "over" {
            "#over - the task is finished"
        } else {
            "#complete - same as #over"
        }
    }

    fn invoke(&self, _ctx: &ToolContext, _args: &str) -> ToolOutcome {
        ToolOutcome::Finished
    }
}

struct ExitMarker;

impl ToolHandler for ExitMarker {
    fn name(&self) -> &'static str {
        "exit"
    }

    fn usage(&self) -> &'static str {
        "#exit - end the session"
    }

    fn invoke(&self, _ctx: &ToolContext, _args: &str) -> ToolOutcome {
        ToolOutcome::Exit
    }
}

struct RunTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for RunTool {
    fn name(&self) -> &'static str {
        "run"
    }

    fn usage(&self) -> &'static str {
        "#run: <command> - execute a host command"
    }

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome {
        let command = args.trim();
        let command = command.strip_prefix('/').unwrap_or(command).trim();
        if command.is_empty() {
            return ToolOutcome::Immediate(ToolOutput::fail(
                "#error: #run requires a command, e.g. #run: say hello",
            ));
        }

        if ctx.mode == Mode::Unattended && !self.services.risk.is_risky(command) {
            return ToolOutcome::Background(run_job(
                Arc::clone(&self.services),
                ctx.user_id.clone(),
                command.to_string(),
            ));
        }

        ToolOutcome::AwaitConfirmation(PendingCommand::confirm(PendingAction::Run {
            command: command.to_string(),
        }))
    }
}

struct FileTool {
    op: FileOp,
    services: Arc<ToolServices>,
}

impl ToolHandler for FileTool {
    fn name(&self) -> &'static str {
        self.op.as_str()
    }

    fn usage(&self) -> &'static str {
        match self.op {
            FileOp::Ls => "#ls: <dir> - list a directory",
            FileOp::Read => "#read: <file> - read a text file",
            FileOp::Diff => "#diff: <file>|<search>|<replace> - replace text once",
        }
    }

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome {
        let op = self.op;
        let args = args.trim().to_string();
        if args.is_empty() && op != FileOp::Ls {
            return usage_error(self.usage());
        }

        let action = PendingAction::File {
            op,
            args: args.clone(),
        };

        if ctx.mode == Mode::Normal {
            return ToolOutcome::AwaitConfirmation(PendingCommand::confirm(action));
        }

        if ctx.is_enabled(op) {
            return ToolOutcome::Background(file_job(Arc::clone(&self.services), op, args));
        }

        if ctx.freeze_remaining_secs > 0 {
            return ToolOutcome::Immediate(ToolOutput::fail(format!(
                "#{op}_result: error - verification is frozen for another {}s",
                ctx.freeze_remaining_secs
            )));
        }

        ToolOutcome::AwaitVerification(PendingCommand::after_verification(action, op))
    }
}

struct GetPresetTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for GetPresetTool {
    fn name(&self) -> &'static str {
        "getpreset"
    }

    fn usage(&self) -> &'static str {
        "#getpreset: <name> - read a preset file"
    }

    fn invoke(&self, _ctx: &ToolContext, args: &str) -> ToolOutcome {
        let name = args.trim().to_string();
        if name.is_empty() {
            return usage_error(self.usage());
        }
        if self.services.presets.is_none() {
            return ToolOutcome::Immediate(ToolOutput::fail(
                "#get_result: error - no preset directory is configured",
            ));
        }

        let services = Arc::clone(&self.services);
        ToolOutcome::Background(Box::new(move || {
            let result = match &services.presets {
                Some(presets) => presets.read(&name).map_err(|error| error.to_string()),
                None => Err("no preset directory is configured".to_string()),
            };
            match result {
                Ok(content) => ToolOutput::ok(format!("#get_result: {content}")),
                Err(error) => ToolOutput::fail(format!("#get_result: error - {error}")),
            }
        }))
    }
}

struct ChooseTool;

impl ToolHandler for ChooseTool {
    fn name(&self) -> &'static str {
        "choose"
    }

    fn usage(&self) -> &'static str {
        "#choose: <A>,<B>,... - ask the user to pick one option"
    }

    fn invoke(&self, _ctx: &ToolContext, args: &str) -> ToolOutcome {
        let options: Vec<String> = args
            .split(',')
            .map(str::trim)
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect();

        if options.is_empty() {
            return ToolOutcome::Immediate(ToolOutput::fail(
                "#error: #choose requires options, e.g. #choose: A,B",
            ));
        }
        ToolOutcome::AwaitChoice(options)
    }
}

struct SearchTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for SearchTool {
    fn name(&self) -> &'static str {
        "search"
    }

    fn usage(&self) -> &'static str {
        "#search: <query> - search the web"
    }

    fn invoke(&self, _ctx: &ToolContext, args: &str) -> ToolOutcome {
        let query = args.trim().to_string();
        if query.is_empty() {
            return usage_error(self.usage());
        }

        let services = Arc::clone(&self.services);
        ToolOutcome::Background(Box::new(move || match services.search.search(&query) {
            Ok(results) => ToolOutput::ok(format!("#search_result: {results}")),
            Err(error) => ToolOutput::fail(format!("#search_result: error - {error}")),
        }))
    }
}

struct TodoTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for TodoTool {
    fn name(&self) -> &'static str {
        "todo"
    }

    fn usage(&self) -> &'static str {
        "#todo: <json array of {id, task, status}> - replace the task list"
    }

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome {
        let todo_json = args.trim();
        if todo_json.is_empty() {
            return reported("todo", Ok(self.services.tasks.list(&ctx.user_id)));
        }
        reported("todo", self.services.tasks.update(&ctx.user_id, todo_json))
    }
}

struct RememberTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for RememberTool {
    fn name(&self) -> &'static str {
        "remember"
    }

    fn usage(&self) -> &'static str {
        "#remember: [category|]<content> - store a long-term memory"
    }

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome {
        let (category, content) = match args.split_once('|') {
            Some((category, content)) => (category.trim(), content.trim()),
            None => ("", args.trim()),
        };
        if content.is_empty() {
            return usage_error(self.usage());
        }
        reported(
            "remember",
            self.services.memory.add(&ctx.user_id, category, content),
        )
    }
}

/// Parses a 1-based memory index bounded by the user's current list.
fn memory_index(raw: &str, len: usize) -> Result<usize, String> {
    let raw = raw.trim();
    match raw.parse::<usize>() {
        Ok(index) if (1..=len).contains(&index) => Ok(index),
        _ if len == 0 => Err(format!("invalid index '{raw}', there are no memories")),
        _ => Err(format!("invalid index '{raw}', expected 1-{len}")),
    }
}

struct ForgetTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for ForgetTool {
    fn name(&self) -> &'static str {
        "forget"
    }

    fn usage(&self) -> &'static str {
        "#forget: <index>|all - delete a memory"
    }

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome {
        let target = args.trim();
        if target.is_empty() {
            return usage_error(self.usage());
        }

        let memory = &self.services.memory;
        if target.eq_ignore_ascii_case("all") {
            return reported("forget", Ok(memory.clear(&ctx.user_id)));
        }

        let result = memory_index(target, memory.len(&ctx.user_id))
            .and_then(|index| memory.remove(&ctx.user_id, index));
        reported("forget", result)
    }
}

struct EditMemTool {
    services: Arc<ToolServices>,
}

impl ToolHandler for EditMemTool {
    fn name(&self) -> &'static str {
        "editmem"
    }

    fn usage(&self) -> &'static str {
        "#editmem: <index>|[category|]<content> - rewrite a memory"
    }

    fn invoke(&self, ctx: &ToolContext, args: &str) -> ToolOutcome {
        let parts: Vec<&str> = args.splitn(3, '|').map(str::trim).collect();
        let (index, category, content) = match parts.as_slice() {
            [index, content] => (*index, None, *content),
            [index, category, content] => (*index, Some(*category), *content),
            _ => return usage_error(self.usage()),
        };
        if content.is_empty() {
            return usage_error(self.usage());
        }

        let memory = &self.services.memory;
        let result = memory_index(index, memory.len(&ctx.user_id))
            .and_then(|index| memory.update(&ctx.user_id, index, category, content));
        reported("editmem", result)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use session_store::Mode;

    use super::*;
    use crate::collaborators::{CommandOutcome, CommandSink};
    use crate::host::{InMemoryMemoryStore, InMemoryTaskStore, UnavailableSearch};
    use crate::tools::{RiskRules, SandboxedFiles};

    struct EchoSink;

    impl CommandSink for EchoSink {
        fn execute(&self, _user_id: &str, command: &str) -> CommandOutcome {
            if command == "silent" {
                return CommandOutcome {
                    success: true,
                    output: None,
                };
            }
            CommandOutcome {
                success: true,
                output: Some(format!("ran {command}")),
            }
        }
    }

    fn registry() -> (tempfile::TempDir, ToolRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("notes.txt"), "hello").expect("write");
        let services = Arc::new(ToolServices {
            files: SandboxedFiles::new(dir.path(), 100 * 1024).expect("sandbox"),
            presets: None,
            commands: Arc::new(EchoSink),
            tasks: Arc::new(InMemoryTaskStore::new()),
            memory: Arc::new(InMemoryMemoryStore::new()),
            search: Arc::new(UnavailableSearch),
            risk: RiskRules::new(["stop", "kill"]),
        });
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry, &services);
        (dir, registry)
    }

    fn immediate(outcome: ToolOutcome) -> ToolOutput {
        match outcome {
            ToolOutcome::Immediate(output) => output,
            other => panic!("expected an immediate result, got {other:?}"),
        }
    }

    fn background(outcome: ToolOutcome) -> ToolOutput {
        match outcome {
            ToolOutcome::Background(job) => job(),
            other => panic!("expected a background job, got {other:?}"),
        }
    }

    #[test]
    fn markers_finish_and_exit() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        assert!(matches!(registry.dispatch(&ctx, "#over"), ToolOutcome::Finished));
        assert!(matches!(registry.dispatch(&ctx, "#complete"), ToolOutcome::Finished));
        assert!(matches!(registry.dispatch(&ctx, "#exit"), ToolOutcome::Exit));
    }

    #[test]
    fn run_in_normal_mode_always_needs_confirmation() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        match registry.dispatch(&ctx, "#run: /say hi") {
            ToolOutcome::AwaitConfirmation(pending) => assert_eq!(
                pending,
                PendingCommand::confirm(PendingAction::Run {
                    command: "say hi".to_string()
                })
            ),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn unattended_run_executes_unless_risky() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Unattended);

        assert_eq!(
            background(registry.dispatch(&ctx, "#run: say hi")),
            ToolOutput::ok("#run_result: ran say hi")
        );
        assert!(matches!(
            registry.dispatch(&ctx, "#run: STOP"),
            ToolOutcome::AwaitConfirmation(_)
        ));
        assert!(background(registry.dispatch(&ctx, "#run: silent"))
            .content
            .contains("effect is unknown"));
    }

    #[test]
    fn empty_run_is_fed_back_as_error() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Unattended);

        let output = immediate(registry.dispatch(&ctx, "#run:  "));
        assert!(!output.ok);
        assert!(output.content.starts_with("#error: #run requires a command"));
    }

    #[test]
    fn unattended_file_tool_needs_verification_until_enabled() {
        let (_dir, registry) = registry();
        let mut ctx = ToolContext::new("alice", Mode::Unattended);

        match registry.dispatch(&ctx, "#read: notes.txt") {
            ToolOutcome::AwaitVerification(pending) => {
                assert_eq!(pending.verification, Some(FileOp::Read));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        ctx.enabled_capabilities.insert(FileOp::Read);
        assert_eq!(
            background(registry.dispatch(&ctx, "#read: notes.txt")),
            ToolOutput::ok("#read_result: hello")
        );
    }

    #[test]
    fn frozen_user_gets_remaining_time_for_gated_file_tools() {
        let (_dir, registry) = registry();
        let mut ctx = ToolContext::new("alice", Mode::Unattended);
        ctx.freeze_remaining_secs = 120;

        let output = immediate(registry.dispatch(&ctx, "#ls: ."));
        assert!(!output.ok);
        assert_eq!(
            output.content,
            "#ls_result: error - verification is frozen for another 120s"
        );
    }

    #[test]
    fn sandbox_errors_are_reported_as_failed_results() {
        let (_dir, registry) = registry();
        let mut ctx = ToolContext::new("alice", Mode::Unattended);
        ctx.enabled_capabilities.insert(FileOp::Read);

        let output = background(registry.dispatch(&ctx, "#read: ../../etc/passwd"));
        assert!(!output.ok);
        assert!(output
            .content
            .starts_with("#read_result: error - Path escapes sandbox root"));
    }

    #[test]
    fn choose_splits_and_trims_options() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        match registry.dispatch(&ctx, "#choose: A, B ,,C") {
            ToolOutcome::AwaitChoice(options) => assert_eq!(options, vec!["A", "B", "C"]),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!immediate(registry.dispatch(&ctx, "#choose: , ")).ok);
    }

    #[test]
    fn getpreset_without_directory_fails_immediately() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        let output = immediate(registry.dispatch(&ctx, "#getpreset: survival"));
        assert!(!output.ok);
        assert!(output.content.starts_with("#get_result: error"));
    }

    #[test]
    fn search_reports_unavailable_provider() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        assert_eq!(
            background(registry.dispatch(&ctx, "#search: rust")),
            ToolOutput::fail("#search_result: error - Search is not available on this host")
        );
    }

    #[test]
    fn memory_tools_validate_indices() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        let added = immediate(registry.dispatch(&ctx, "#remember: prefs|likes dark mode"));
        assert!(added.ok);
        assert!(added.content.starts_with("#remember_result: Remembered #1 [prefs]"));

        let bad = immediate(registry.dispatch(&ctx, "#forget: 2"));
        assert_eq!(
            bad,
            ToolOutput::fail("#forget_result: error - invalid index '2', expected 1-1")
        );
        assert!(!immediate(registry.dispatch(&ctx, "#editmem: 0|x")).ok);

        let edited = immediate(registry.dispatch(&ctx, "#editmem: 1|light mode"));
        assert!(edited.ok);
        assert!(edited.content.contains("light mode"));

        let cleared = immediate(registry.dispatch(&ctx, "#forget: ALL"));
        assert_eq!(cleared, ToolOutput::ok("#forget_result: Forgot all 1 memories"));
    }

    #[test]
    fn todo_updates_and_lists() {
        let (_dir, registry) = registry();
        let ctx = ToolContext::new("alice", Mode::Normal);

        let updated = immediate(registry.dispatch(
            &ctx,
            r#"#todo: [{"id":"1","task":"backup world","status":"in_progress"}]"#,
        ));
        assert!(updated.ok);
        assert!(updated.content.starts_with("#todo_result: Task list updated (0/1 completed)"));

        let listed = immediate(registry.dispatch(&ctx, "#todo"));
        assert!(listed.content.contains("backup world"));

        assert!(!immediate(registry.dispatch(&ctx, "#todo: not json")).ok);
    }
}
