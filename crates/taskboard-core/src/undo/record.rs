use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::Task;

/// The closed set of undoable mutation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateTask,
    UpdateTask,
    DeleteTask,
    BulkUpdate,
    MoveTask,
}

impl ActionType {
    pub const ALL: [Self; 5] = [
        Self::CreateTask,
        Self::UpdateTask,
        Self::DeleteTask,
        Self::BulkUpdate,
        Self::MoveTask,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateTask => "create_task",
            Self::UpdateTask => "update_task",
            Self::DeleteTask => "delete_task",
            Self::BulkUpdate => "bulk_update",
            Self::MoveTask => "move_task",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owned copy of the state on one side of a change.
///
/// Snapshots are plain values: nothing outside the record can reach into
/// them, so editing the live task never rewrites history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Snapshot {
    Task(Task),
    Tasks(Vec<Task>),
}

impl Snapshot {
    /// All tasks in the snapshot, one or many.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        match self {
            Self::Task(task) => std::slice::from_ref(task),
            Self::Tasks(tasks) => tasks,
        }
    }

    /// The single task, if this is a single-task snapshot.
    #[must_use]
    pub const fn as_task(&self) -> Option<&Task> {
        match self {
            Self::Task(task) => Some(task),
            Self::Tasks(_) => None,
        }
    }

    #[must_use]
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks().iter().map(|t| t.id.clone()).collect()
    }
}

impl From<Task> for Snapshot {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

impl From<Vec<Task>> for Snapshot {
    fn from(tasks: Vec<Task>) -> Self {
        Self::Tasks(tasks)
    }
}

/// Free-form context carried with a change for messages and replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    /// Human-readable text, e.g. `Update task "Write docs"`. Left empty, it
    /// is generated when the change is recorded.
    pub description: String,
    /// Ids of the affected tasks.
    pub task_ids: Vec<String>,
    /// Bulk operation name (`update`, `delete`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// The change that was applied, when the states alone do not show it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<serde_json::Value>,
}

impl ChangeMetadata {
    #[must_use]
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }
}

/// Unique change identifier: `chg-<unix millis>-<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeId(String);

impl ChangeId {
    pub(crate) fn new(at: DateTime<Utc>, sequence: u64) -> Self {
        Self(format!("chg-{}-{sequence}", at.timestamp_millis()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A committed, reversible mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    id: ChangeId,
    action: ActionType,
    previous_state: Option<Snapshot>,
    new_state: Option<Snapshot>,
    metadata: ChangeMetadata,
    recorded_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub(crate) fn new(
        id: ChangeId,
        action: ActionType,
        previous_state: Option<Snapshot>,
        new_state: Option<Snapshot>,
        mut metadata: ChangeMetadata,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        if metadata.task_ids.is_empty() {
            metadata.task_ids = new_state
                .as_ref()
                .or(previous_state.as_ref())
                .map(Snapshot::task_ids)
                .unwrap_or_default();
        }
        if metadata.description.is_empty() {
            metadata.description = describe(action, previous_state.as_ref(), new_state.as_ref());
        }
        Self {
            id,
            action,
            previous_state,
            new_state,
            metadata,
            recorded_at,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ChangeId {
        &self.id
    }

    #[must_use]
    pub const fn action(&self) -> ActionType {
        self.action
    }

    /// State before the change; `None` for creations.
    #[must_use]
    pub const fn previous_state(&self) -> Option<&Snapshot> {
        self.previous_state.as_ref()
    }

    /// State after the change; `None` for deletions.
    #[must_use]
    pub const fn new_state(&self) -> Option<&Snapshot> {
        self.new_state.as_ref()
    }

    #[must_use]
    pub const fn metadata(&self) -> &ChangeMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.metadata.description
    }

    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

/// Default toast text for a change.
#[must_use]
pub fn describe(action: ActionType, previous: Option<&Snapshot>, new: Option<&Snapshot>) -> String {
    let subject = new.or(previous);
    let title = subject
        .and_then(Snapshot::as_task)
        .map_or("untitled", |task| task.title.as_str());

    match action {
        ActionType::CreateTask => format!("Create task \"{title}\""),
        ActionType::UpdateTask => format!("Update task \"{title}\""),
        ActionType::DeleteTask => format!("Delete task \"{title}\""),
        ActionType::MoveTask => {
            let from = previous.and_then(Snapshot::as_task).map(|t| t.status);
            let to = new.and_then(Snapshot::as_task).map(|t| t.status);
            match (from, to) {
                (Some(from), Some(to)) => format!("Move task \"{title}\" from {from} to {to}"),
                _ => format!("Move task \"{title}\""),
            }
        }
        ActionType::BulkUpdate => {
            let count = subject.map_or(0, |s| s.tasks().len());
            format!("Bulk update ({count} task{})", if count == 1 { "" } else { "s" })
        }
    }
}
