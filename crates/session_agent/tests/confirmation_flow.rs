mod support;

use session_agent::collaborators::Notice;
use session_agent::error::AgentError;
use session_store::{GenerationStatus, Mode, Role};
use support::{reply, Harness};

#[test]
fn normal_mode_run_waits_for_confirmation_then_executes() {
    let h = Harness::new(vec![reply("#run: say hello")]);
    h.start("alice");

    assert!(h.say("alice", "greet everyone"));
    assert_eq!(h.status("alice"), GenerationStatus::WaitingConfirm);
    assert!(h.commands.executed().is_empty());
    assert!(h.notices("alice").iter().any(|notice| matches!(
        notice,
        Notice::Prompt(text) if text.contains("run: say hello")
    )));

    assert!(h.say("alice", "y"));
    assert_eq!(h.commands.executed(), vec!["say hello".to_string()]);
    assert_eq!(h.status("alice"), GenerationStatus::Idle);
    assert_eq!(h.gateway.call_count(), 2);
    assert!(h
        .history("alice")
        .iter()
        .any(|message| message.role == Role::User && message.content == "#run_result: ok: say hello"));

    let status = h.orchestrator.status("alice").expect("status");
    assert_eq!(status.tool_success_count, 2);
    assert_eq!(status.pending, None);
}

#[test]
fn declining_records_a_cancellation_note_and_goes_idle() {
    let h = Harness::new(vec![reply("#run: say hello")]);
    h.start("alice");
    h.say("alice", "greet everyone");

    assert!(h.say("alice", "n"));

    assert_eq!(h.status("alice"), GenerationStatus::Idle);
    assert!(h.commands.executed().is_empty());
    assert_eq!(h.gateway.call_count(), 1);
    let last = h.last_message("alice");
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, "#cancelled: the user declined `run: say hello`");
    assert!(h.session("alice", |session| session.pending_command().is_none()));
}

#[test]
fn unrelated_reply_while_waiting_repeats_the_prompt() {
    let h = Harness::new(vec![reply("#run: say hello")]);
    h.start("alice");
    h.say("alice", "greet everyone");

    assert!(h.say("alice", "maybe later"));

    assert_eq!(h.status("alice"), GenerationStatus::WaitingConfirm);
    assert!(h.notices("alice").iter().any(|notice| matches!(
        notice,
        Notice::Prompt(text) if text.starts_with("Waiting for confirmation of `run: say hello`")
    )));
    assert_eq!(h.gateway.call_count(), 1);
}

#[test]
fn switching_mode_keeps_the_pending_command() {
    let h = Harness::new(vec![reply("#run: say hello")]);
    h.start("alice");
    h.say("alice", "greet everyone");

    h.orchestrator
        .switch_mode("alice", Mode::Unattended)
        .expect("switch mode");

    assert_eq!(h.status("alice"), GenerationStatus::WaitingConfirm);
    assert_eq!(h.session("alice", |session| session.mode()), Mode::Unattended);
    assert_eq!(
        h.orchestrator.status("alice").expect("status").pending.as_deref(),
        Some("run: say hello")
    );

    h.say("alice", "yes");
    assert_eq!(h.commands.executed(), vec!["say hello".to_string()]);
}

#[test]
fn confirm_without_pending_command_is_rejected() {
    let h = Harness::new(Vec::new());
    h.start("alice");

    let error = h.orchestrator.confirm("alice").expect_err("nothing pending");
    assert!(matches!(error, AgentError::Validation(_)));
}

#[test]
fn choice_becomes_the_next_user_message() {
    let h = Harness::new(vec![reply("Pick one.\n#choose: A, B, C")]);
    h.start("alice");
    h.say("alice", "what next?");

    assert_eq!(h.status("alice"), GenerationStatus::WaitingChoice);
    assert!(h.notices("alice").contains(&Notice::Choices(vec![
        "A".to_string(),
        "B".to_string(),
        "C".to_string(),
    ])));

    assert!(h.orchestrator.submit_user_message("alice", "B"));
    assert_eq!(h.status("alice"), GenerationStatus::Thinking);
    assert_eq!(h.spawner.pending(), 1);
    let last = h.last_message("alice");
    assert_eq!((last.role, last.content.as_str()), (Role::User, "B"));

    h.drain();
    assert_eq!(h.status("alice"), GenerationStatus::Idle);
    assert_eq!(h.last_prompt_to_model(), "B");
}

#[test]
fn choice_accepts_a_one_based_index() {
    let h = Harness::new(vec![reply("#choose: red,green")]);
    h.start("alice");
    h.say("alice", "colour?");

    h.orchestrator.select("alice", "2").expect("select");
    h.drain();

    assert_eq!(h.last_prompt_to_model(), "green");
}

#[test]
fn busy_session_rejects_new_messages() {
    let h = Harness::new(Vec::new());
    h.start("alice");

    assert!(h.orchestrator.submit_user_message("alice", "first"));
    assert_eq!(h.status("alice"), GenerationStatus::Thinking);

    assert!(h.orchestrator.submit_user_message("alice", "second"));
    assert!(h.has_error_notice("alice", "Still working on your previous message"));
    assert_eq!(h.history("alice").len(), 1);

    h.drain();
    assert_eq!(h.gateway.call_count(), 1);
    assert_eq!(h.status("alice"), GenerationStatus::Idle);
}

#[test]
fn unknown_user_is_not_handled() {
    let h = Harness::new(Vec::new());

    assert!(!h.orchestrator.submit_user_message("ghost", "hello"));
    assert!(matches!(
        h.orchestrator.confirm("ghost"),
        Err(AgentError::NoSession(user)) if user == "ghost"
    ));
    assert_eq!(h.gateway.call_count(), 0);
}

#[test]
fn blank_input_is_ignored() {
    let h = Harness::new(Vec::new());
    h.start("alice");

    assert!(h.say("alice", "   "));
    assert_eq!(h.gateway.call_count(), 0);
    assert!(h.history("alice").is_empty());
}
