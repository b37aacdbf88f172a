//! Undo/redo history of committed task mutations.
//!
//! Only server-confirmed changes are recorded. Undo and redo do not rewrite
//! anything themselves; they hand the stored snapshots to the
//! [`ChangeHandler`] registered for the record's [`ActionType`]:
//!
//! | Call | Stack move | Handler receives |
//! |---|---|---|
//! | `undo()` | undo → redo | `(previous, new, metadata, Undo)` |
//! | `redo()` | redo → undo | `(new, previous, metadata, Redo)` |
//!
//! The stack move happens before the handler runs. A failing handler leaves
//! the record where it was moved to, so the same call can simply be retried.

pub mod handlers;
pub mod record;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use handlers::{ChangeHandler, HandlerTable, ReplayDirection};
pub use record::{ActionType, ChangeId, ChangeMetadata, ChangeRecord, Snapshot, describe};

use crate::clock::Clock;
use crate::config::HistoryConfig;
use crate::error::ErrorCode;
use crate::model::{Task, TaskPatch};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A registered handler failed while replaying a change.
#[derive(Debug, thiserror::Error)]
#[error("{direction:?} of \"{description}\" failed: {source}")]
pub struct ReplayError {
    pub change_id: ChangeId,
    pub description: String,
    pub direction: ReplayDirection,
    #[source]
    pub source: anyhow::Error,
}

impl ReplayError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::ReplayFailed
    }
}

/// Shape of a bulk operation for [`UndoRedoManager::record_bulk_operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum BulkChange {
    Update(TaskPatch),
    Delete,
}

impl BulkChange {
    const fn operation(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Delete => "delete",
        }
    }
}

// ---------------------------------------------------------------------------
// Reentrancy guard
// ---------------------------------------------------------------------------

/// Holds the "applying" flag up for the duration of a replay. Dropping the
/// guard, including by cancelling the replay future, lowers it.
struct ApplyingGuard(Arc<AtomicBool>);

impl ApplyingGuard {
    fn engage(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for ApplyingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// UndoRedoManager
// ---------------------------------------------------------------------------

/// Bounded undo/redo stacks plus the handler table used to replay them.
#[derive(Debug)]
pub struct UndoRedoManager {
    undo_stack: VecDeque<ChangeRecord>,
    redo_stack: Vec<ChangeRecord>,
    max_size: usize,
    handlers: HandlerTable,
    applying: Arc<AtomicBool>,
    sequence: u64,
    clock: Arc<dyn Clock>,
}

impl UndoRedoManager {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, config: &HistoryConfig) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_size: config.max_size.max(1),
            handlers: HandlerTable::default(),
            applying: Arc::new(AtomicBool::new(false)),
            sequence: 0,
            clock,
        }
    }

    /// Install the replay handler for `action`, replacing any earlier one.
    pub fn register_change_handler(&mut self, action: ActionType, handler: Arc<dyn ChangeHandler>) {
        if self.handlers.register(action, handler).is_some() {
            tracing::debug!(%action, "change handler replaced");
        }
    }

    #[must_use]
    pub const fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// True while an undo/redo replay is running.
    #[must_use]
    pub fn is_applying_change(&self) -> bool {
        self.applying.load(Ordering::SeqCst)
    }

    /// Push a committed change onto the undo stack.
    ///
    /// Clears the redo stack and evicts the oldest entries beyond the size
    /// limit. Returns `None` without recording anything while a replay is
    /// in progress.
    pub fn record_change(
        &mut self,
        action: ActionType,
        previous_state: Option<Snapshot>,
        new_state: Option<Snapshot>,
        metadata: ChangeMetadata,
    ) -> Option<ChangeId> {
        if self.is_applying_change() {
            tracing::debug!(%action, "change recorded during replay ignored");
            return None;
        }

        let now = self.clock.now();
        self.sequence += 1;
        let id = ChangeId::new(now, self.sequence);
        let record = ChangeRecord::new(id.clone(), action, previous_state, new_state, metadata, now);

        self.undo_stack.push_back(record);
        self.redo_stack.clear();
        self.evict_overflow();
        Some(id)
    }

    pub fn record_task_creation(&mut self, task: &Task) -> Option<ChangeId> {
        self.record_change(
            ActionType::CreateTask,
            None,
            Some(task.clone().into()),
            ChangeMetadata::default(),
        )
    }

    /// Records nothing when both states are equal.
    pub fn record_task_update(&mut self, old: &Task, new: &Task) -> Option<ChangeId> {
        if old == new {
            return None;
        }
        self.record_change(
            ActionType::UpdateTask,
            Some(old.clone().into()),
            Some(new.clone().into()),
            ChangeMetadata::default(),
        )
    }

    pub fn record_task_deletion(&mut self, task: &Task) -> Option<ChangeId> {
        self.record_change(
            ActionType::DeleteTask,
            Some(task.clone().into()),
            None,
            ChangeMetadata::default(),
        )
    }

    /// Records nothing when the status did not change.
    pub fn record_task_move(&mut self, old: &Task, new: &Task) -> Option<ChangeId> {
        if old.status == new.status {
            return None;
        }
        self.record_change(
            ActionType::MoveTask,
            Some(old.clone().into()),
            Some(new.clone().into()),
            ChangeMetadata::default(),
        )
    }

    /// Record one change covering several tasks. `tasks` are the states
    /// before the operation.
    pub fn record_bulk_operation(&mut self, tasks: &[Task], change: &BulkChange) -> Option<ChangeId> {
        if tasks.is_empty() {
            return None;
        }
        let operation = change.operation();
        let (new_state, changes) = match change {
            BulkChange::Update(patch) => (
                Some(Snapshot::Tasks(tasks.iter().map(|t| t.patched(patch)).collect())),
                serde_json::to_value(patch).ok(),
            ),
            BulkChange::Delete => (None, None),
        };
        let count = tasks.len();
        let metadata = ChangeMetadata {
            description: format!(
                "Bulk {operation} ({count} task{})",
                if count == 1 { "" } else { "s" }
            ),
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
            operation: Some(operation.to_string()),
            changes,
        };
        self.record_change(
            ActionType::BulkUpdate,
            Some(Snapshot::Tasks(tasks.to_vec())),
            new_state,
            metadata,
        )
    }

    /// Reverse the most recent change.
    ///
    /// Returns `Ok(None)` when there is nothing to undo.
    ///
    /// # Errors
    ///
    /// Propagates a handler failure. The record stays on the redo stack.
    pub async fn undo(&mut self) -> Result<Option<ChangeRecord>, ReplayError> {
        let Some(record) = self.undo_stack.pop_back() else {
            return Ok(None);
        };
        self.redo_stack.push(record.clone());
        self.replay(&record, ReplayDirection::Undo).await?;
        Ok(Some(record))
    }

    /// Re-apply the most recently undone change.
    ///
    /// Returns `Ok(None)` when there is nothing to redo.
    ///
    /// # Errors
    ///
    /// Propagates a handler failure. The record stays on the undo stack.
    pub async fn redo(&mut self) -> Result<Option<ChangeRecord>, ReplayError> {
        let Some(record) = self.redo_stack.pop() else {
            return Ok(None);
        };
        self.undo_stack.push_back(record.clone());
        self.replay(&record, ReplayDirection::Redo).await?;
        Ok(Some(record))
    }

    async fn replay(
        &self,
        record: &ChangeRecord,
        direction: ReplayDirection,
    ) -> Result<(), ReplayError> {
        let action = record.action();
        let Some(handler) = self.handlers.get(action) else {
            tracing::warn!(%action, change_id = %record.id(), "no change handler registered; replay skipped");
            return Ok(());
        };

        let (target, source) = match direction {
            ReplayDirection::Undo => (record.previous_state(), record.new_state()),
            ReplayDirection::Redo => (record.new_state(), record.previous_state()),
        };

        let _guard = ApplyingGuard::engage(&self.applying);
        handler
            .apply(target, source, record.metadata(), direction)
            .await
            .map_err(|source| {
                tracing::warn!(%action, change_id = %record.id(), ?direction, error = %source, "change replay failed");
                ReplayError {
                    change_id: record.id().clone(),
                    description: record.description().to_string(),
                    direction,
                    source,
                }
            })
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    #[must_use]
    pub fn undo_description(&self) -> Option<&str> {
        self.undo_stack.back().map(ChangeRecord::description)
    }

    #[must_use]
    pub fn redo_description(&self) -> Option<&str> {
        self.redo_stack.last().map(ChangeRecord::description)
    }

    #[must_use]
    pub fn peek_undo(&self) -> Option<&ChangeRecord> {
        self.undo_stack.back()
    }

    #[must_use]
    pub fn peek_redo(&self) -> Option<&ChangeRecord> {
        self.redo_stack.last()
    }

    #[must_use]
    pub fn undo_stack_len(&self) -> usize {
        self.undo_stack.len()
    }

    #[must_use]
    pub fn redo_stack_len(&self) -> usize {
        self.redo_stack.len()
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the history limit; shrinking evicts the oldest records now.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
        self.evict_overflow();
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }

    fn evict_overflow(&mut self) {
        while self.undo_stack.len() > self.max_size {
            if let Some(evicted) = self.undo_stack.pop_front() {
                tracing::trace!(change_id = %evicted.id(), "oldest change evicted from history");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Status;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        target: Option<Snapshot>,
        source: Option<Snapshot>,
        direction: ReplayDirection,
    }

    /// Applies snapshots to an in-memory board and logs every call.
    #[derive(Default)]
    struct BoardHandler {
        board: Mutex<BTreeMap<String, Task>>,
        calls: Mutex<Vec<Call>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ChangeHandler for BoardHandler {
        async fn apply(
            &self,
            target: Option<&Snapshot>,
            source: Option<&Snapshot>,
            _metadata: &ChangeMetadata,
            direction: ReplayDirection,
        ) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call {
                target: target.cloned(),
                source: source.cloned(),
                direction,
            });
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("store offline");
            }
            let mut board = self.board.lock().unwrap();
            if let Some(source) = source {
                for task in source.tasks() {
                    board.remove(&task.id);
                }
            }
            if let Some(target) = target {
                for task in target.tasks() {
                    board.insert(task.id.clone(), task.clone());
                }
            }
            Ok(())
        }
    }

    fn manager(max_size: usize) -> UndoRedoManager {
        UndoRedoManager::new(Arc::new(ManualClock::default()), &HistoryConfig { max_size })
    }

    fn task(id: &str, title: &str) -> Task {
        Task::new(id, title, ManualClock::default().now())
    }

    fn with_handler(mgr: &mut UndoRedoManager) -> Arc<BoardHandler> {
        let handler = Arc::new(BoardHandler::default());
        for action in ActionType::ALL {
            mgr.register_change_handler(action, handler.clone());
        }
        handler
    }

    #[tokio::test]
    async fn empty_stacks_do_nothing() {
        let mut mgr = manager(50);
        assert!(!mgr.can_undo());
        assert!(!mgr.can_redo());
        assert!(mgr.undo().await.unwrap().is_none());
        assert!(mgr.redo().await.unwrap().is_none());
        assert!(mgr.undo_description().is_none());
    }

    #[tokio::test]
    async fn undoing_a_creation_targets_absence() {
        let mut mgr = manager(50);
        let handler = with_handler(&mut mgr);
        let created = task("t1", "X");
        mgr.record_task_creation(&created);
        assert_eq!(mgr.undo_description(), Some("Create task \"X\""));

        let record = mgr.undo().await.unwrap().expect("a record was undone");
        assert_eq!(record.action(), ActionType::CreateTask);
        assert_eq!(
            handler.calls.lock().unwrap().clone(),
            vec![Call {
                target: None,
                source: Some(Snapshot::Task(created)),
                direction: ReplayDirection::Undo,
            }]
        );
        assert!(mgr.can_redo());
        assert_eq!(mgr.redo_description(), Some("Create task \"X\""));
    }

    #[tokio::test]
    async fn undo_then_redo_restores_post_change_state() {
        let mut mgr = manager(50);
        let handler = with_handler(&mut mgr);
        let before = task("t1", "Draft");
        let mut after = before.clone();
        after.title = "Final".into();
        handler.board.lock().unwrap().insert(after.id.clone(), after.clone());
        mgr.record_task_update(&before, &after);

        mgr.undo().await.unwrap();
        assert_eq!(handler.board.lock().unwrap()["t1"], before);
        mgr.redo().await.unwrap();
        assert_eq!(handler.board.lock().unwrap()["t1"], after);

        let calls = handler.calls.lock().unwrap();
        assert_eq!(calls[1].direction, ReplayDirection::Redo);
        assert_eq!(calls[1].target, Some(Snapshot::Task(after.clone())));
        assert_eq!(calls[1].source, Some(Snapshot::Task(before.clone())));
    }

    #[test]
    fn identical_update_is_not_recorded() {
        let mut mgr = manager(50);
        let t = task("t1", "Same");
        assert!(mgr.record_task_update(&t, &t.clone()).is_none());
        assert_eq!(mgr.undo_stack_len(), 0);
    }

    #[tokio::test]
    async fn recording_clears_redo() {
        let mut mgr = manager(50);
        mgr.record_task_creation(&task("t1", "A"));
        mgr.undo().await.unwrap();
        assert!(mgr.can_redo());

        mgr.record_task_creation(&task("t2", "B"));
        assert!(!mgr.can_redo());
        assert_eq!(mgr.undo_stack_len(), 1);
    }

    #[test]
    fn history_is_bounded_and_evicts_oldest() {
        let mut mgr = manager(3);
        for i in 0..5 {
            mgr.record_task_creation(&task(&format!("t{i}"), &format!("Task {i}")));
        }
        assert_eq!(mgr.undo_stack_len(), 3);
        assert_eq!(
            mgr.peek_undo().unwrap().metadata().task_ids,
            vec!["t4".to_string()]
        );

        mgr.set_max_size(1);
        assert_eq!(mgr.undo_stack_len(), 1);
        assert_eq!(mgr.undo_description(), Some("Create task \"Task 4\""));
    }

    #[test]
    fn records_are_independent_of_the_live_task() {
        let mut mgr = manager(50);
        let mut live = task("t1", "Original");
        mgr.record_task_creation(&live);
        live.title = "Mutated".into();
        live.labels.insert("late".into());

        let stored = mgr.peek_undo().unwrap().new_state().unwrap().as_task().unwrap();
        assert_eq!(stored.title, "Original");
        assert!(stored.labels.is_empty());
    }

    #[test]
    fn move_is_recorded_only_on_status_change() {
        let mut mgr = manager(50);
        let before = task("t1", "Card");
        let mut after = before.clone();
        after.title = "Renamed".into();
        assert!(mgr.record_task_move(&before, &after).is_none());

        after.status = Status::InProgress;
        assert!(mgr.record_task_move(&before, &after).is_some());
        assert_eq!(
            mgr.undo_description(),
            Some("Move task \"Renamed\" from todo to in_progress")
        );
    }

    #[test]
    fn bulk_operation_snapshots_every_task() {
        let mut mgr = manager(50);
        let tasks = vec![task("a", "A"), task("b", "B")];
        let id = mgr
            .record_bulk_operation(&tasks, &BulkChange::Update(TaskPatch::status(Status::InProgress)))
            .expect("recorded");
        let record = mgr.peek_undo().unwrap();
        assert_eq!(record.id(), &id);
        assert_eq!(record.description(), "Bulk update (2 tasks)");
        assert_eq!(record.metadata().operation.as_deref(), Some("update"));
        let after = record.new_state().unwrap().tasks();
        assert!(after.iter().all(|t| t.status == Status::InProgress));
        assert_eq!(record.previous_state().unwrap().tasks(), tasks.as_slice());

        assert!(mgr.record_bulk_operation(&[], &BulkChange::Delete).is_none());
        mgr.record_bulk_operation(&tasks[..1], &BulkChange::Delete);
        assert_eq!(mgr.undo_description(), Some("Bulk delete (1 task)"));
        assert!(mgr.peek_undo().unwrap().new_state().is_none());
    }

    #[tokio::test]
    async fn failed_undo_leaves_record_on_redo_stack() {
        let mut mgr = manager(50);
        let handler = with_handler(&mut mgr);
        mgr.record_task_deletion(&task("t1", "Gone"));
        handler.fail.store(true, Ordering::SeqCst);

        let err = mgr.undo().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplayFailed);
        assert!(err.to_string().contains("Delete task \"Gone\""));
        assert!(!mgr.can_undo());
        assert!(mgr.can_redo());
        assert!(!mgr.is_applying_change());

        // Retrying from the redo side works once the handler recovers.
        handler.fail.store(false, Ordering::SeqCst);
        assert!(mgr.redo().await.unwrap().is_some());
        assert!(mgr.can_undo());
    }

    #[tokio::test]
    async fn missing_handler_skips_replay_but_moves_the_record() {
        let mut mgr = manager(50);
        mgr.record_task_creation(&task("t1", "A"));
        let record = mgr.undo().await.unwrap();
        assert!(record.is_some());
        assert!(mgr.can_redo());
    }

    struct Stalls;

    #[async_trait]
    impl ChangeHandler for Stalls {
        async fn apply(
            &self,
            _target: Option<&Snapshot>,
            _source: Option<&Snapshot>,
            _metadata: &ChangeMetadata,
            _direction: ReplayDirection,
        ) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_replay_releases_the_guard() {
        let mut mgr = manager(50);
        mgr.register_change_handler(ActionType::CreateTask, Arc::new(Stalls));
        mgr.record_task_creation(&task("t1", "A"));

        let timed_out =
            tokio::time::timeout(std::time::Duration::from_secs(1), mgr.undo()).await;
        assert!(timed_out.is_err());
        assert!(!mgr.is_applying_change());
        assert!(mgr.record_task_creation(&task("t2", "B")).is_some());
    }

    #[test]
    fn recording_is_refused_while_applying() {
        let mut mgr = manager(50);
        let guard = ApplyingGuard::engage(&mgr.applying);
        assert!(mgr.record_task_creation(&task("t1", "A")).is_none());
        drop(guard);
        assert!(mgr.record_task_creation(&task("t1", "A")).is_some());
    }

    #[test]
    fn clear_empties_both_stacks() {
        let mut mgr = manager(50);
        mgr.record_task_creation(&task("t1", "A"));
        mgr.clear();
        assert!(!mgr.can_undo());
        assert!(!mgr.can_redo());
    }
}
