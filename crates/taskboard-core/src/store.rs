//! Contract with the remote task store, plus an in-memory implementation.
//!
//! The core never talks to the network itself. The validator reads
//! [`TaskStore::can_complete_task`]; the orchestrator and the undo/redo
//! replay handlers call the mutating methods.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::ErrorCode;
use crate::model::{NewTask, Status, Task, TaskPatch};

/// Failure reported by a task store call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("task '{0}' not found")]
    NotFound(String),

    #[error("task '{0}' already exists")]
    AlreadyExists(String),

    #[error("task store rejected the change: {0}")]
    Rejected(String),

    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::TaskNotFound,
            Self::AlreadyExists(_) | Self::Rejected(_) => ErrorCode::StoreRejected,
            Self::Unavailable(_) => ErrorCode::StoreUnavailable,
        }
    }
}

/// Answer to "may this task move to done?".
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompletionCheck {
    pub can_complete: bool,
    /// Unfinished tasks standing in the way.
    pub blocking_tasks: Vec<Task>,
}

impl CompletionCheck {
    #[must_use]
    pub const fn clear() -> Self {
        Self {
            can_complete: true,
            blocking_tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn blocking_titles(&self) -> Vec<String> {
        self.blocking_tasks.iter().map(|t| t.title.clone()).collect()
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Task, StoreError>;

    async fn create_task(&self, draft: NewTask) -> Result<Task, StoreError>;

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError>;

    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;

    async fn can_complete_task(&self, id: &str) -> Result<CompletionCheck, StoreError>;
}

#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        (**self).get_task(id).await
    }

    async fn create_task(&self, draft: NewTask) -> Result<Task, StoreError> {
        (**self).create_task(draft).await
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        (**self).update_task(id, patch).await
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        (**self).delete_task(id).await
    }

    async fn can_complete_task(&self, id: &str) -> Result<CompletionCheck, StoreError> {
        (**self).can_complete_task(id).await
    }
}

// ---------------------------------------------------------------------------
// InMemoryTaskStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<String, Task>,
    /// task id -> ids that must be done before it can complete.
    blocked_by: BTreeMap<String, BTreeSet<String>>,
    next_id: u64,
    fail_next: Option<StoreError>,
}

impl Inner {
    fn allocate_id(&mut self) -> String {
        loop {
            self.next_id += 1;
            let id = format!("task-{}", self.next_id);
            if !self.tasks.contains_key(&id) {
                return id;
            }
        }
    }

    fn take_failure(&mut self) -> Result<(), StoreError> {
        self.fail_next.take().map_or(Ok(()), Err)
    }
}

/// Process-local [`TaskStore`] with blocking links and failure injection.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryTaskStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
        }
    }

    /// Put a task in the store verbatim, bypassing id allocation.
    pub async fn seed(&self, task: Task) {
        self.inner.lock().await.tasks.insert(task.id.clone(), task);
    }

    /// Record that `task_id` cannot complete until `blocker_id` is done.
    pub async fn add_blocker(&self, task_id: &str, blocker_id: &str) {
        self.inner
            .lock()
            .await
            .blocked_by
            .entry(task_id.to_string())
            .or_default()
            .insert(blocker_id.to_string());
    }

    /// Make the next mutating call fail with `error`.
    pub async fn fail_next(&self, error: StoreError) {
        self.inner.lock().await.fail_next = Some(error);
    }

    /// Current contents keyed by id.
    pub async fn snapshot(&self) -> BTreeMap<String, Task> {
        self.inner.lock().await.tasks.clone()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.inner
            .lock()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn create_task(&self, mut draft: NewTask) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;

        let id = match draft.id.take() {
            Some(id) if inner.tasks.contains_key(&id) => {
                return Err(StoreError::AlreadyExists(id));
            }
            Some(id) => id,
            None => inner.allocate_id(),
        };
        let task = draft.into_task(id.clone(), self.clock.now());
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;

        let now = self.clock.now();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        task.apply_patch(&patch);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.take_failure()?;

        inner
            .tasks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn can_complete_task(&self, id: &str) -> Result<CompletionCheck, StoreError> {
        let inner = self.inner.lock().await;
        if !inner.tasks.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let blocking_tasks: Vec<Task> = inner
            .blocked_by
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|blocker| inner.tasks.get(blocker))
            .filter(|blocker| blocker.status != Status::Done)
            .cloned()
            .collect();

        Ok(CompletionCheck {
            can_complete: blocking_tasks.is_empty(),
            blocking_tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn store() -> (Arc<ManualClock>, InMemoryTaskStore) {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryTaskStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn create_allocates_ids_and_stamps_time() {
        let (clock, store) = store();
        let first = store.create_task(NewTask::titled("A")).await.unwrap();
        let second = store.create_task(NewTask::titled("B")).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.status, Status::Todo);
        assert_eq!(first.updated_at, clock.now());
    }

    #[tokio::test]
    async fn create_with_taken_id_is_rejected() {
        let (_, store) = store();
        let task = store.create_task(NewTask::titled("A")).await.unwrap();
        let err = store
            .create_task(NewTask::restoring(&task))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(task.id));
    }

    #[tokio::test]
    async fn update_bumps_updated_at() {
        let (clock, store) = store();
        let task = store.create_task(NewTask::titled("A")).await.unwrap();
        clock.advance(Duration::minutes(3));
        let updated = store
            .update_task(&task.id, TaskPatch::status(Status::InProgress))
            .await
            .unwrap();
        assert_eq!(updated.status, Status::InProgress);
        assert_eq!(updated.updated_at - task.updated_at, Duration::minutes(3));
    }

    #[tokio::test]
    async fn injected_failure_hits_exactly_one_call() {
        let (_, store) = store();
        store
            .fail_next(StoreError::Unavailable("offline".into()))
            .await;
        let err = store.create_task(NewTask::titled("A")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreUnavailable);
        assert!(store.create_task(NewTask::titled("A")).await.is_ok());
    }

    #[tokio::test]
    async fn unfinished_blockers_prevent_completion() {
        let (_, store) = store();
        let main = store.create_task(NewTask::titled("Main")).await.unwrap();
        let dep = store.create_task(NewTask::titled("Schema")).await.unwrap();
        store.add_blocker(&main.id, &dep.id).await;

        let check = store.can_complete_task(&main.id).await.unwrap();
        assert!(!check.can_complete);
        assert_eq!(check.blocking_titles(), vec!["Schema".to_string()]);

        store
            .update_task(
                &dep.id,
                TaskPatch {
                    status: Some(Status::Done),
                    ..TaskPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            store.can_complete_task(&main.id).await.unwrap(),
            CompletionCheck::clear()
        );
    }
}
