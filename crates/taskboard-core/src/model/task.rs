use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::{fmt, str::FromStr};

use crate::error::ErrorCode;

/// The four board columns a task moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Todo,
    InProgress,
    Review,
    Done,
}

impl Status {
    /// Every status in board order.
    pub const ALL: [Self; 4] = [Self::Todo, Self::InProgress, Self::Review, Self::Done];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Urgent];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// A task as owned by the task store.
///
/// Fields the core does not interpret are kept in `extra` so that snapshots
/// carry them through undo/redo and rollback untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Task {
    /// Minimal task in `todo` with default priority.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: Status::Todo,
            priority: Priority::default(),
            labels: BTreeSet::new(),
            assignee_id: None,
            due_date: None,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    /// Apply every field present in `patch`, leaving the rest untouched.
    ///
    /// `updated_at` is not bumped here; the store owns that timestamp.
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(labels) = &patch.labels {
            self.labels.clone_from(labels);
        }
        if let Some(assignee) = &patch.assignee_id {
            self.assignee_id.clone_from(assignee);
        }
        if let Some(due) = patch.due_date {
            self.due_date = due;
        }
        for (key, value) in &patch.extra {
            if value.is_null() {
                self.extra.remove(key);
            } else {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }

    /// Return a copy with `patch` applied.
    #[must_use]
    pub fn patched(&self, patch: &TaskPatch) -> Self {
        let mut next = self.clone();
        next.apply_patch(patch);
        next
    }
}

/// Payload for creating a task.
///
/// `id` is normally left empty so the store allocates one; replaying an
/// undone deletion sets it to bring the task back under its old identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub status: Option<Status>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NewTask {
    #[must_use]
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Creation payload that reproduces `task` exactly, identity included.
    #[must_use]
    pub fn restoring(task: &Task) -> Self {
        Self {
            id: Some(task.id.clone()),
            title: task.title.clone(),
            status: Some(task.status),
            priority: task.priority,
            labels: task.labels.clone(),
            assignee_id: task.assignee_id.clone(),
            due_date: task.due_date,
            extra: task.extra.clone(),
        }
    }

    /// Materialize the task a store would hold for this payload.
    #[must_use]
    pub fn into_task(self, id: String, now: DateTime<Utc>) -> Task {
        Task {
            id,
            title: self.title,
            status: self.status.unwrap_or(Status::Todo),
            priority: self.priority,
            labels: self.labels,
            assignee_id: self.assignee_id,
            due_date: self.due_date,
            updated_at: now,
            extra: self.extra,
        }
    }
}

/// Partial update. Nullable fields use `Option<Option<_>>`: the outer
/// `None` means "leave alone", `Some(None)` means "clear".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    /// Opaque fields; a JSON `null` removes the key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TaskPatch {
    #[must_use]
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A patch that overwrites every field of the current task with the
    /// values in `target`, including removing opaque keys `current` has and
    /// `target` lacks.
    #[must_use]
    pub fn replace_with(current: Option<&Task>, target: &Task) -> Self {
        let mut extra = target.extra.clone();
        if let Some(current) = current {
            for key in current.extra.keys() {
                extra
                    .entry(key.clone())
                    .or_insert(serde_json::Value::Null);
            }
        }
        Self {
            title: Some(target.title.clone()),
            status: Some(target.status),
            priority: Some(target.priority),
            labels: Some(target.labels.clone()),
            assignee_id: Some(target.assignee_id.clone()),
            due_date: Some(target.due_date),
            extra,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

impl ParseEnumError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::InvalidEnumValue
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        match normalized.as_str() {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        match normalized.as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(ParseEnumError {
                expected: "priority",
                got: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, NewTask, Priority, Status, Task, TaskPatch};
    use chrono::{TimeZone, Utc};
    use std::str::FromStr;

    fn sample() -> Task {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut task = Task::new("t1", "Write docs", now);
        task.labels.insert("docs".into());
        task.extra
            .insert("sprint_id".into(), serde_json::json!("s-42"));
        task
    }

    #[test]
    fn enum_json_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&Status::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(serde_json::to_string(&Priority::Urgent).unwrap(), "\"urgent\"");
        assert_eq!(
            serde_json::from_str::<Status>("\"review\"").unwrap(),
            Status::Review
        );
    }

    #[test]
    fn parse_is_lenient_about_case_and_separators() {
        assert_eq!(Status::from_str("In-Progress").unwrap(), Status::InProgress);
        assert_eq!(Status::from_str(" DONE ").unwrap(), Status::Done);
        assert_eq!(Priority::from_str("High").unwrap(), Priority::High);
        for value in Status::ALL {
            assert_eq!(Status::from_str(&value.to_string()).unwrap(), value);
        }
    }

    #[test]
    fn parse_rejects_unknown_values() {
        let err = Status::from_str("blocked").unwrap_err();
        assert_eq!(err.expected, "status");
        assert_eq!(err.to_string(), "invalid status: 'blocked'");
        assert_eq!(err.code(), ErrorCode::InvalidEnumValue);
        assert!(Priority::from_str("critical").is_err());
    }

    #[test]
    fn priority_defaults_to_medium() {
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!(NewTask::titled("Fresh").priority, Priority::Medium);
    }

    #[test]
    fn unknown_fields_survive_deserialization() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": "t9",
            "title": "Opaque",
            "status": "todo",
            "updated_at": "2024-05-01T12:00:00Z",
            "story_points": 3
        }))
        .unwrap();
        assert_eq!(task.extra["story_points"], serde_json::json!(3));
        assert_eq!(task.priority, Priority::Medium);
    }

    #[test]
    fn patch_clears_nullable_fields_and_extra_keys() {
        let mut task = sample();
        task.assignee_id = Some("u1".into());
        let patch = TaskPatch {
            assignee_id: Some(None),
            extra: [("sprint_id".to_string(), serde_json::Value::Null)]
                .into_iter()
                .collect(),
            ..TaskPatch::default()
        };
        task.apply_patch(&patch);
        assert!(task.assignee_id.is_none());
        assert!(task.extra.is_empty());
        assert_eq!(task.title, "Write docs");
    }

    #[test]
    fn replace_with_reproduces_target() {
        let before = sample();
        let mut after = before.clone();
        after.title = "Rewrite docs".into();
        after.status = Status::Review;
        after.extra.clear();

        let patch = TaskPatch::replace_with(Some(&after), &before);
        assert_eq!(after.patched(&patch), before);

        let patch = TaskPatch::replace_with(Some(&before), &after);
        assert_eq!(before.patched(&patch), after);
    }

    #[test]
    fn restoring_keeps_identity() {
        let task = sample();
        let draft = NewTask::restoring(&task);
        assert_eq!(draft.id.as_deref(), Some("t1"));
        let rebuilt = draft.into_task("t1".into(), task.updated_at);
        assert_eq!(rebuilt, task);
    }
}
