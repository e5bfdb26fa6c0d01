use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::collaborators::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    fn icon(self) -> &'static str {
        match self {
            Self::Pending => "☐",
            Self::InProgress => "»",
            Self::Completed => "✓",
            Self::Cancelled => "✗",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskItem {
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
}

/// Task lists kept in memory per user. Each update replaces the whole list.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    lists: Mutex<HashMap<String, Vec<TaskItem>>>,
}

impl InMemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn items(&self, user_id: &str) -> Vec<TaskItem> {
        self.lock().get(user_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<TaskItem>>> {
        match self.lists.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn parse_items(todo_json: &str) -> Result<Vec<TaskItem>, String> {
    let trimmed = todo_json.trim();
    if trimmed.is_empty() {
        return Err("Task list must not be empty; expected a JSON array".to_string());
    }

    let items: Vec<TaskItem> =
        serde_json::from_str(trimmed).map_err(|error| format!("Invalid task JSON: {error}"))?;

    for (index, item) in items.iter().enumerate() {
        if item.id.trim().is_empty() {
            return Err(format!("Task #{} is missing a non-empty id", index + 1));
        }
        if item.task.trim().is_empty() {
            return Err(format!("Task '{}' is missing a non-empty task", item.id));
        }
    }

    let in_progress = items
        .iter()
        .filter(|item| item.status == TaskStatus::InProgress)
        .count();
    if in_progress > 1 {
        return Err(format!(
            "Only one task may be in_progress at a time; found {in_progress}"
        ));
    }

    Ok(items)
}

fn render(items: &[TaskItem]) -> String {
    if items.is_empty() {
        return "No tasks".to_string();
    }

    items
        .iter()
        .map(|item| {
            let mut line = format!("{} [{}] {}", item.status.icon(), item.id, item.task);
            if let Some(description) = item.description.as_deref() {
                line.push_str(" - ");
                line.push_str(description);
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl TaskStore for InMemoryTaskStore {
    fn update(&self, user_id: &str, todo_json: &str) -> Result<String, String> {
        let items = parse_items(todo_json)?;
        let completed = items
            .iter()
            .filter(|item| item.status == TaskStatus::Completed)
            .count();
        let summary = format!(
            "Task list updated ({completed}/{} completed)\n{}",
            items.len(),
            render(&items)
        );
        self.lock().insert(user_id.to_string(), items);
        Ok(summary)
    }

    fn list(&self, user_id: &str) -> String {
        render(&self.items(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_replaces_list_and_renders_icons() {
        let store = InMemoryTaskStore::new();
        store
            .update("alice", r#"[{"id":"1","task":"old"}]"#)
            .expect("first update");

        let summary = store
            .update(
                "alice",
                r#"[{"id":"1","task":"write config","status":"completed"},
                    {"id":"2","task":"reload","status":"in_progress","priority":"high"}]"#,
            )
            .expect("second update");

        assert!(summary.starts_with("Task list updated (1/2 completed)"));
        assert_eq!(store.items("alice").len(), 2);
        assert_eq!(store.list("alice"), "✓ [1] write config\n» [2] reload");
    }

    #[test]
    fn rejects_missing_id_or_task() {
        let store = InMemoryTaskStore::new();

        let error = store
            .update("alice", r#"[{"id":" ","task":"x"}]"#)
            .expect_err("blank id should fail");
        assert!(error.contains("id"), "{error}");

        let error = store
            .update("alice", r#"[{"id":"1","task":""}]"#)
            .expect_err("blank task should fail");
        assert!(error.contains("task"), "{error}");
    }

    #[test]
    fn rejects_multiple_in_progress_items() {
        let store = InMemoryTaskStore::new();
        let error = store
            .update(
                "alice",
                r#"[{"id":"1","task":"a","status":"in_progress"},
                    {"id":"2","task":"b","status":"in_progress"}]"#,
            )
            .expect_err("two in-progress items should fail");

        assert!(error.contains("found 2"), "{error}");
        assert_eq!(store.list("alice"), "No tasks");
    }

    #[test]
    fn rejects_non_array_and_unknown_status() {
        let store = InMemoryTaskStore::new();
        assert!(store.update("alice", r#"{"id":"1"}"#).is_err());
        assert!(store
            .update("alice", r#"[{"id":"1","task":"a","status":"blocked"}]"#)
            .is_err());
        assert!(store.update("alice", "   ").is_err());
    }

    #[test]
    fn lists_are_per_user() {
        let store = InMemoryTaskStore::new();
        store
            .update("alice", r#"[{"id":"1","task":"mine"}]"#)
            .expect("alice update");

        assert_eq!(store.list("bob"), "No tasks");
        assert_eq!(store.list("alice"), "☐ [1] mine");
    }
}
