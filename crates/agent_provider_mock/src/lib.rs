//! Deterministic scripted implementation of the shared `agent_provider` contract.
//!
//! This crate contains no transport/protocol logic and is intended for local
//! development and contract-level integration testing.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use agent_provider::{
    CancelSignal, CompletionRequest, GatewayError, ModelGateway, ModelReply, ProviderProfile,
};

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

#[derive(Debug)]
struct ScriptState {
    replies: VecDeque<Result<ModelReply, GatewayError>>,
    requests: Vec<CompletionRequest>,
}

/// Gateway that replays a fixed script of replies and records every request.
///
/// Once the script is exhausted every round answers with the fallback reply,
/// which defaults to the completion marker.
#[derive(Debug)]
pub struct ScriptedGateway {
    fallback: ModelReply,
    delay: Duration,
    state: Mutex<ScriptState>,
}

impl ScriptedGateway {
    /// Creates a gateway that answers with `replies` in order.
    #[must_use]
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self::with_results(replies.into_iter().map(Ok).collect())
    }

    /// Creates a gateway whose script may include failures.
    #[must_use]
    pub fn with_results(results: Vec<Result<ModelReply, GatewayError>>) -> Self {
        Self {
            fallback: ModelReply::text("#over"),
            delay: Duration::ZERO,
            state: Mutex::new(ScriptState {
                replies: results.into(),
                requests: Vec::new(),
            }),
        }
    }

    /// Replaces the reply used once the script runs out.
    #[must_use]
    pub fn with_fallback(mut self, fallback: ModelReply) -> Self {
        self.fallback = fallback;
        self
    }

    /// Makes every round block for `delay`, polling the cancel flag meanwhile.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Appends more replies to the end of the script.
    pub fn push_reply(&self, reply: ModelReply) {
        lock_unpoisoned(&self.state).replies.push_back(Ok(reply));
    }

    /// Returns a copy of every request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock_unpoisoned(&self.state).requests.clone()
    }

    /// Returns how many rounds have been requested.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock_unpoisoned(&self.state).requests.len()
    }

    /// Returns how many scripted replies have not been consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        lock_unpoisoned(&self.state).replies.len()
    }

    fn wait_for_delay(&self, cancel: &CancelSignal) -> bool {
        if self.delay.is_zero() {
            return !cancel.load(Ordering::SeqCst);
        }

        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            thread::sleep(Self::POLL_INTERVAL.min(self.delay));
        }
        !cancel.load(Ordering::SeqCst)
    }

    const POLL_INTERVAL: Duration = Duration::from_millis(10);
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new(Vec::new()).with_fallback(ModelReply::text(
            "The mock provider has no scripted answer for that.\n#over",
        ))
    }
}

impl ModelGateway for ScriptedGateway {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: MOCK_PROVIDER_ID.to_string(),
            thinking_level: None,
        }
    }


    fn complete(
        &self,
        req: CompletionRequest,
        cancel: CancelSignal,
    ) -> Result<ModelReply, GatewayError> {
        lock_unpoisoned(&self.state).requests.push(req);

        if !self.wait_for_delay(&cancel) {
            return Err(GatewayError::Cancelled);
        }

        let next = lock_unpoisoned(&self.state).replies.pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
