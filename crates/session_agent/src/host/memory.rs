use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::collaborators::MemoryStore;

pub const MAX_MEMORIES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub category: String,
    pub content: String,
    pub created_at: String,
}

/// Remembered facts kept in memory, capped per user.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    entries: Mutex<HashMap<String, Vec<MemoryEntry>>>,
}

impl InMemoryMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self, user_id: &str) -> Vec<MemoryEntry> {
        self.lock().get(user_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<MemoryEntry>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

fn check_index(index: usize, len: usize) -> Result<usize, String> {
    if index == 0 || index > len {
        return Err(format!("Index {index} is out of range (1-{len})"));
    }
    Ok(index - 1)
}

impl MemoryStore for InMemoryMemoryStore {
    fn add(&self, user_id: &str, category: &str, content: &str) -> Result<String, String> {
        let content = content.trim();
        if content.is_empty() {
            return Err("Memory content must not be empty".to_string());
        }

        let mut entries = self.lock();
        let list = entries.entry(user_id.to_string()).or_default();
        if list.len() >= MAX_MEMORIES {
            return Err(format!(
                "Memory is full ({MAX_MEMORIES} entries); forget something first"
            ));
        }

        let category = match category.trim() {
            "" => "general",
            other => other,
        };
        list.push(MemoryEntry {
            category: category.to_string(),
            content: content.to_string(),
            created_at: timestamp(),
        });
        Ok(format!("Remembered #{} [{category}] {content}", list.len()))
    }

    fn remove(&self, user_id: &str, index: usize) -> Result<String, String> {
        let mut entries = self.lock();
        let list = entries.entry(user_id.to_string()).or_default();
        let position = check_index(index, list.len())?;
        let removed = list.remove(position);
        Ok(format!("Forgot #{index}: {}", removed.content))
    }

    fn update(
        &self,
        user_id: &str,
        index: usize,
        category: Option<&str>,
        content: &str,
    ) -> Result<String, String> {
        let content = content.trim();
        if content.is_empty() {
            return Err("Memory content must not be empty".to_string());
        }

        let mut entries = self.lock();
        let list = entries.entry(user_id.to_string()).or_default();
        let position = check_index(index, list.len())?;
        let entry = &mut list[position];
        if let Some(category) = category.map(str::trim).filter(|value| !value.is_empty()) {
            entry.category = category.to_string();
        }
        entry.content = content.to_string();
        Ok(format!("Updated #{index} [{}] {content}", entry.category))
    }

    fn clear(&self, user_id: &str) -> String {
        let removed = self
            .lock()
            .remove(user_id)
            .map(|list| list.len())
            .unwrap_or(0);
        format!("Forgot all {removed} memories")
    }

    fn list(&self, user_id: &str) -> String {
        let entries = self.entries(user_id);
        if entries.is_empty() {
            return "No memories".to_string();
        }

        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| format!("{}. [{}] {}", index + 1, entry.category, entry.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn len(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map_or(0, Vec::len)
    }
}
