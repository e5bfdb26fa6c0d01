use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use tracing::{debug, error};

/// Unit of background work: a model call or a tool job plus the code that
/// posts its result back to the session.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Schedules work off the caller's thread.
pub trait Spawner: Send + Sync {
    /// `label` names the work for logs and thread names.
    fn spawn(&self, label: &str, task: Task) -> Result<(), String>;
}

/// Runs every task on its own named worker thread.
#[derive(Debug, Default)]
pub struct ThreadSpawner {
    next_id: AtomicU64,
}

impl ThreadSpawner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(&self, label: &str, task: Task) -> Result<(), String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = format!("session-agent-{label}-{id}");
        let thread_label = name.clone();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(worker = %thread_label, "background task panicked");
                }
            })
            .map(|_| ())
            .map_err(|error| format!("Failed to spawn worker: {error}"))
    }
}

/// Queues tasks until the host drains them.
///
/// Headless hosts and tests call [`QueuedSpawner::run_until_idle`] to run
/// queued work, including anything that work enqueues, on the current thread.
#[derive(Default)]
pub struct QueuedSpawner {
    queue: Mutex<VecDeque<(String, Task)>>,
}

impl QueuedSpawner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    /// Labels of queued tasks, oldest first.
    #[must_use]
    pub fn pending_labels(&self) -> Vec<String> {
        self.lock_queue()
            .iter()
            .map(|(label, _)| label.clone())
            .collect()
    }

    /// Runs the oldest queued task. Returns false when the queue was empty.
    pub fn run_next(&self) -> bool {
        let next = self.lock_queue().pop_front();
        match next {
            Some((label, task)) => {
                debug!(task = %label, "running queued task");
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks until the queue stays empty and returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0usize;
        while self.run_next() {
            ran += 1;
        }
        ran
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<(String, Task)>> {
        lock_unpoisoned(&self.queue)
    }
}

impl Spawner for QueuedSpawner {
    fn spawn(&self, label: &str, task: Task) -> Result<(), String> {
        self.lock_queue().push_back((label.to_string(), task));
        Ok(())
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
