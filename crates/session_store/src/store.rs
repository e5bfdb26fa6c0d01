use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::SessionStoreError;
use crate::session::Session;

/// Handle to one user's session. Holding its lock serializes that user.
pub type SharedSession = Arc<Mutex<Session>>;

/// In-memory registry of live sessions keyed by user id.
///
/// The registry lock is only held for map operations; per-session locks are
/// taken after it has been released.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, SharedSession>>,
    max_sessions: Option<usize>,
}

impl SessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that refuses new sessions beyond `max_sessions`.
    #[must_use]
    pub fn with_capacity_limit(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions: Some(max_sessions),
        }
    }

    /// Returns the user's session, creating it when absent.
    ///
    /// The boolean is true when the session was created by this call.
    pub fn get_or_create(
        &self,
        user_id: &str,
        now_ms: u64,
    ) -> Result<(SharedSession, bool), SessionStoreError> {
        let mut sessions = lock_unpoisoned(&self.sessions);
        if let Some(existing) = sessions.get(user_id) {
            return Ok((Arc::clone(existing), false));
        }

        if let Some(limit) = self.max_sessions {
            if sessions.len() >= limit {
                return Err(SessionStoreError::CapacityReached { limit });
            }
        }

        let session = Arc::new(Mutex::new(Session::new(user_id, now_ms)));
        sessions.insert(user_id.to_string(), Arc::clone(&session));
        Ok((session, true))
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<SharedSession> {
        lock_unpoisoned(&self.sessions).get(user_id).cloned()
    }

    #[must_use]
    pub fn contains(&self, user_id: &str) -> bool {
        lock_unpoisoned(&self.sessions).contains_key(user_id)
    }

    pub fn remove(&self, user_id: &str) -> Option<SharedSession> {
        lock_unpoisoned(&self.sessions).remove(user_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.sessions).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock_unpoisoned(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Lists users whose sessions have been inactive for at least `timeout_ms`.
    #[must_use]
    pub fn idle_users(&self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let snapshot: Vec<(String, SharedSession)> = lock_unpoisoned(&self.sessions)
            .iter()
            .map(|(id, session)| (id.clone(), Arc::clone(session)))
            .collect();

        let mut idle: Vec<String> = snapshot
            .into_iter()
            .filter(|(_, session)| lock_unpoisoned(session).is_idle_since(now_ms, timeout_ms))
            .map(|(id, _)| id)
            .collect();
        idle.sort();
        idle
    }

    /// Removes every idle session and returns the evicted user ids.
    pub fn evict_idle(&self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let idle = self.idle_users(now_ms, timeout_ms);
        let mut sessions = lock_unpoisoned(&self.sessions);
        for user_id in &idle {
            sessions.remove(user_id);
        }
        idle
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
