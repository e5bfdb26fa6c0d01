//! Challenge/response gate that unlocks file capabilities per user.
//!
//! A challenge carries a six-digit code delivered out of band. Wrong answers
//! burn attempts; running out freezes the user for a fixed window. The freeze
//! is a timestamp compared against the injected [`Clock`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use session_store::FileOp;
use tracing::{info, warn};

use crate::collaborators::{Clock, Notice, SecretSink, UserNotifier};
use crate::config::VerificationConfig;
use crate::error::VerificationError;

/// Runs once when a challenge is answered correctly.
pub type VerifiedCallback = Box<dyn FnOnce() + Send>;

struct Challenge {
    issued: u64,
    secret: String,
    attempts_remaining: u32,
    expires_at_ms: u64,
    on_success: Option<VerifiedCallback>,
}

#[derive(Default)]
struct UserGate {
    challenges: BTreeMap<FileOp, Challenge>,
    issued: u64,
    frozen_until_ms: Option<u64>,
}

impl UserGate {
    fn oldest(&self) -> Option<FileOp> {
        self.challenges
            .iter()
            .min_by_key(|(_, challenge)| challenge.issued)
            .map(|(capability, _)| *capability)
    }
}

pub struct VerificationGate {
    max_attempts: u32,
    freeze_ms: u64,
    challenge_ttl_ms: u64,
    secrets: Arc<dyn SecretSink>,
    notifier: Arc<dyn UserNotifier>,
    clock: Arc<dyn Clock>,
    users: Mutex<HashMap<String, UserGate>>,
}

enum Reply {
    NotHandled,
    Frozen(u64),
    Expired,
    Verified(Option<VerifiedCallback>),
    Retry(u32),
    Locked(u64),
}

impl VerificationGate {
    #[must_use]
    pub fn new(
        config: &VerificationConfig,
        secrets: Arc<dyn SecretSink>,
        notifier: Arc<dyn UserNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_attempts: config.max_attempts,
            freeze_ms: config.freeze_secs.saturating_mul(1000),
            challenge_ttl_ms: config.challenge_ttl_secs.saturating_mul(1000),
            secrets,
            notifier,
            clock,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh code for `capability`, replacing any earlier challenge for it.
    pub fn start_challenge(
        &self,
        user_id: &str,
        capability: FileOp,
        on_success: VerifiedCallback,
    ) -> Result<(), VerificationError> {
        let now = self.clock.now_ms();
        let remaining = self.remaining_freeze_seconds(user_id);
        if remaining > 0 {
            self.notifier.notify(
                user_id,
                Notice::Error(format!(
                    "Verification is frozen, try again in {remaining}s"
                )),
            );
            return Err(VerificationError::Frozen {
                remaining_secs: remaining,
            });
        }

        let secret = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        let hint = self
            .secrets
            .deliver(user_id, capability.as_str(), &secret)
            .map_err(VerificationError::Delivery)?;

        let mut users = self.lock_users();
        let gate = users.entry(user_id.to_string()).or_default();
        gate.issued += 1;
        let issued = gate.issued;
        gate.challenges.insert(
            capability,
            Challenge {
                issued,
                secret,
                attempts_remaining: self.max_attempts,
                expires_at_ms: now.saturating_add(self.challenge_ttl_ms),
                on_success: Some(on_success),
            },
        );
        drop(users);

        info!(user = user_id, capability = %capability, "verification challenge started");
        self.notifier.notify(
            user_id,
            Notice::Prompt(format!(
                "Verification required to enable #{capability}. {hint}. Reply with the 6-digit code ({} attempts).",
                self.max_attempts
            )),
        );
        Ok(())
    }

    /// Checks `input` against the active challenge.
    ///
    /// Returns false when there is nothing to answer. While the user is frozen
    /// every attempt is handled and rejected without touching any counter.
    pub fn respond(&self, user_id: &str, capability: FileOp, input: &str) -> bool {
        let now = self.clock.now_ms();
        let reply = {
            let mut users = self.lock_users();
            match users.get_mut(user_id) {
                None => Reply::NotHandled,
                Some(gate) => self.evaluate(gate, capability, input.trim(), now),
            }
        };

        match reply {
            Reply::NotHandled => false,
            Reply::Frozen(remaining) => {
                self.notifier.notify(
                    user_id,
                    Notice::Error(format!(
                        "Verification is frozen, try again in {remaining}s"
                    )),
                );
                true
            }
            Reply::Expired => {
                self.secrets.revoke(user_id, capability.as_str());
                self.notifier.notify(
                    user_id,
                    Notice::Error(format!(
                        "The verification code for #{capability} expired, start again"
                    )),
                );
                true
            }
            Reply::Verified(callback) => {
                self.secrets.revoke(user_id, capability.as_str());
                info!(user = user_id, capability = %capability, "verification passed");
                self.notifier.notify(
                    user_id,
                    Notice::Info(format!("Verified, #{capability} is enabled")),
                );
                if let Some(callback) = callback {
                    callback();
                }
                true
            }
            Reply::Retry(left) => {
                self.notifier.notify(
                    user_id,
                    Notice::Error(format!("Incorrect code, {left} attempt(s) left")),
                );
                true
            }
            Reply::Locked(freeze_secs) => {
                for capability in FileOp::ALL {
                    self.secrets.revoke(user_id, capability.as_str());
                }
                warn!(user = user_id, freeze_secs, "verification attempts exhausted");
                self.notifier.notify(
                    user_id,
                    Notice::Error(format!(
                        "Too many incorrect codes, verification is frozen for {freeze_secs}s"
                    )),
                );
                true
            }
        }
    }

    fn evaluate(&self, gate: &mut UserGate, capability: FileOp, input: &str, now: u64) -> Reply {
        if let Some(until) = gate.frozen_until_ms {
            if now < until {
                return Reply::Frozen(ceil_secs(until - now));
            }
            gate.frozen_until_ms = None;
        }

        let Some(challenge) = gate.challenges.get_mut(&capability) else {
            return Reply::NotHandled;
        };

        if now >= challenge.expires_at_ms {
            gate.challenges.remove(&capability);
            return Reply::Expired;
        }

        if !input.is_empty() && input == challenge.secret {
            let callback = gate
                .challenges
                .remove(&capability)
                .and_then(|mut challenge| challenge.on_success.take());
            return Reply::Verified(callback);
        }

        challenge.attempts_remaining = challenge.attempts_remaining.saturating_sub(1);
        if challenge.attempts_remaining > 0 {
            return Reply::Retry(challenge.attempts_remaining);
        }

        gate.challenges.clear();
        gate.frozen_until_ms = Some(now.saturating_add(self.freeze_ms));
        Reply::Locked(ceil_secs(self.freeze_ms))
    }

    /// Capability of the user's oldest live challenge, if any.
    #[must_use]
    pub fn active_capability(&self, user_id: &str) -> Option<FileOp> {
        self.lock_users().get(user_id).and_then(UserGate::oldest)
    }

    /// Challenge a chat reply answers: the one whose code it matches, else
    /// the oldest.
    #[must_use]
    pub fn capability_for_reply(&self, user_id: &str, input: &str) -> Option<FileOp> {
        let input = input.trim();
        let users = self.lock_users();
        let gate = users.get(user_id)?;
        gate.challenges
            .iter()
            .find(|(_, challenge)| !input.is_empty() && challenge.secret == input)
            .map(|(capability, _)| *capability)
            .or_else(|| gate.oldest())
    }

    #[must_use]
    pub fn is_challenged(&self, user_id: &str, capability: FileOp) -> bool {
        self.lock_users()
            .get(user_id)
            .is_some_and(|gate| gate.challenges.contains_key(&capability))
    }

    /// Seconds left on the user's freeze, rounded up; 0 when not frozen.
    #[must_use]
    pub fn remaining_freeze_seconds(&self, user_id: &str) -> u64 {
        let now = self.clock.now_ms();
        self.lock_users()
            .get(user_id)
            .and_then(|gate| gate.frozen_until_ms)
            .filter(|until| *until > now)
            .map_or(0, |until| ceil_secs(until - now))
    }

    /// Drops one pending challenge without running its callback.
    pub fn cancel(&self, user_id: &str, capability: FileOp) -> bool {
        let removed = self
            .lock_users()
            .get_mut(user_id)
            .and_then(|gate| gate.challenges.remove(&capability))
            .is_some();
        if removed {
            self.secrets.revoke(user_id, capability.as_str());
        }
        removed
    }

    /// Forgets every challenge for a user. Freezes survive so exit cannot reset them.
    pub fn clear_user(&self, user_id: &str) {
        let cleared: Vec<FileOp> = self
            .lock_users()
            .get_mut(user_id)
            .map(|gate| std::mem::take(&mut gate.challenges).into_keys().collect())
            .unwrap_or_default();
        for capability in cleared {
            self.secrets.revoke(user_id, capability.as_str());
        }
    }

    fn lock_users(&self) -> MutexGuard<'_, HashMap<String, UserGate>> {
        match self.users.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::host::{ManualClock, RecordingNotifier};

    #[derive(Default)]
    struct CapturingSink {
        codes: Mutex<HashMap<String, String>>,
    }

    impl CapturingSink {
        fn code(&self, user_id: &str, capability: &str) -> String {
            self.codes
                .lock()
                .expect("codes lock")
                .get(&format!("{user_id}/{capability}"))
                .cloned()
                .expect("code should have been delivered")
        }
    }

    impl SecretSink for CapturingSink {
        fn deliver(&self, user_id: &str, capability: &str, secret: &str) -> Result<String, String> {
            self.codes
                .lock()
                .expect("codes lock")
                .insert(format!("{user_id}/{capability}"), secret.to_string());
            Ok("Check the console".to_string())
        }
    }

    struct Fixture {
        gate: VerificationGate,
        sink: Arc<CapturingSink>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(CapturingSink::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let notifier = Arc::new(RecordingNotifier::new());
        let gate = VerificationGate::new(
            &VerificationConfig {
                max_attempts: 3,
                freeze_secs: 60,
                challenge_ttl_secs: 120,
                secret_dir: "unused".into(),
            },
            sink.clone(),
            notifier.clone(),
            clock.clone(),
        );
        Fixture {
            gate,
            sink,
            clock,
            notifier,
        }
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> VerifiedCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn respond_without_challenge_is_not_handled() {
        let fx = fixture();
        assert!(!fx.gate.respond("alice", FileOp::Read, "123456"));
        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), 0);
    }

    #[test]
    fn correct_code_runs_callback_once_and_clears_challenge() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        fx.gate
            .start_challenge("alice", FileOp::Read, counting_callback(&counter))
            .expect("challenge should start");
        assert_eq!(fx.gate.active_capability("alice"), Some(FileOp::Read));

        let code = fx.sink.code("alice", "read");
        assert!(fx.gate.respond("alice", FileOp::Read, &format!("  {code} ")));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!fx.gate.is_challenged("alice", FileOp::Read));
        assert!(!fx.gate.respond("alice", FileOp::Read, &code));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn three_wrong_answers_freeze_and_fourth_is_rejected() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        fx.gate
            .start_challenge("alice", FileOp::Diff, counting_callback(&counter))
            .expect("challenge should start");
        let code = fx.sink.code("alice", "diff");

        assert!(fx.gate.respond("alice", FileOp::Diff, "wrong"));
        assert!(fx.gate.respond("alice", FileOp::Diff, "   "));
        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), 0);
        assert!(fx.gate.respond("alice", FileOp::Diff, "nope"));

        let frozen_for = fx.gate.remaining_freeze_seconds("alice");
        assert_eq!(frozen_for, 60);
        assert!(!fx.gate.is_challenged("alice", FileOp::Diff));

        assert!(fx.gate.respond("alice", FileOp::Diff, &code));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), frozen_for);

        let notices = fx.notifier.notices_for("alice");
        assert!(matches!(
            notices.last(),
            Some(Notice::Error(text)) if text.contains("frozen")
        ));
    }

    #[test]
    fn frozen_user_cannot_start_new_challenges_until_window_passes() {
        let fx = fixture();
        fx.gate
            .start_challenge("alice", FileOp::Ls, Box::new(|| {}))
            .expect("challenge should start");
        for _ in 0..3 {
            fx.gate.respond("alice", FileOp::Ls, "bad");
        }

        let error = fx
            .gate
            .start_challenge("alice", FileOp::Read, Box::new(|| {}))
            .expect_err("frozen user should be refused");
        assert_eq!(error, VerificationError::Frozen { remaining_secs: 60 });

        fx.clock.advance_secs(30);
        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), 30);

        fx.clock.advance_secs(31);
        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), 0);
        fx.gate
            .start_challenge("alice", FileOp::Read, Box::new(|| {}))
            .expect("challenge should start after freeze");
    }

    #[test]
    fn freeze_is_per_user() {
        let fx = fixture();
        fx.gate
            .start_challenge("alice", FileOp::Ls, Box::new(|| {}))
            .expect("alice challenge");
        for _ in 0..3 {
            fx.gate.respond("alice", FileOp::Ls, "bad");
        }

        fx.gate
            .start_challenge("bob", FileOp::Ls, Box::new(|| {}))
            .expect("bob should not be frozen");
        assert_eq!(fx.gate.remaining_freeze_seconds("bob"), 0);
    }

    #[test]
    fn expired_challenge_is_cleared_without_callback() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        fx.gate
            .start_challenge("alice", FileOp::Read, counting_callback(&counter))
            .expect("challenge should start");
        let code = fx.sink.code("alice", "read");

        fx.clock.advance_secs(121);
        assert!(fx.gate.respond("alice", FileOp::Read, &code));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!fx.gate.is_challenged("alice", FileOp::Read));
        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), 0);
    }

    #[test]
    fn cancel_and_clear_drop_challenges() {
        let fx = fixture();
        fx.gate
            .start_challenge("alice", FileOp::Ls, Box::new(|| {}))
            .expect("ls challenge");
        fx.gate
            .start_challenge("alice", FileOp::Read, Box::new(|| {}))
            .expect("read challenge");

        assert!(fx.gate.cancel("alice", FileOp::Ls));
        assert!(!fx.gate.cancel("alice", FileOp::Ls));
        assert_eq!(fx.gate.active_capability("alice"), Some(FileOp::Read));

        fx.gate.clear_user("alice");
        assert_eq!(fx.gate.active_capability("alice"), None);
    }

    #[test]
    fn oldest_challenge_is_active_regardless_of_capability_order() {
        let fx = fixture();
        fx.gate
            .start_challenge("alice", FileOp::Read, Box::new(|| {}))
            .expect("read challenge");
        fx.gate
            .start_challenge("alice", FileOp::Ls, Box::new(|| {}))
            .expect("ls challenge");

        assert_eq!(fx.gate.active_capability("alice"), Some(FileOp::Read));
        assert_eq!(
            fx.gate.capability_for_reply("alice", "not a code"),
            Some(FileOp::Read)
        );
    }

    #[test]
    fn reply_is_routed_to_the_challenge_whose_code_it_matches() {
        let fx = fixture();
        let counter = Arc::new(AtomicUsize::new(0));
        fx.gate
            .start_challenge("alice", FileOp::Ls, Box::new(|| {}))
            .expect("ls challenge");
        fx.gate
            .start_challenge("alice", FileOp::Read, counting_callback(&counter))
            .expect("read challenge");
        let read_code = fx.sink.code("alice", "read");

        let capability = fx
            .gate
            .capability_for_reply("alice", &format!(" {read_code} "))
            .expect("a challenge is live");
        assert_eq!(capability, FileOp::Read);
        assert!(fx.gate.respond("alice", capability, &read_code));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(fx.gate.is_challenged("alice", FileOp::Ls));
        assert_eq!(fx.gate.capability_for_reply("alice", &read_code), Some(FileOp::Ls));
        assert_eq!(fx.gate.capability_for_reply("bob", &read_code), None);
    }

    #[test]
    fn clock_rounding_reports_partial_seconds_up() {
        let fx = fixture();
        fx.gate
            .start_challenge("alice", FileOp::Ls, Box::new(|| {}))
            .expect("challenge");
        for _ in 0..3 {
            fx.gate.respond("alice", FileOp::Ls, "bad");
        }
        fx.clock.set_ms(1_000_000 + 59_500);

        assert_eq!(fx.gate.remaining_freeze_seconds("alice"), 1);
    }
}
