//! The mutation pipeline used by the board UI.
//!
//! Every mutation runs the same steps in order:
//!
//! 1. validate the status change, if any (rejections stop here)
//! 2. apply the change to the local board and track it as pending
//! 3. call the task store
//! 4. confirm (adopt the server's data) or roll back (restore the snapshot)
//! 5. record the committed change for undo
//!
//! User-facing outcomes are sent as [`Notice`]s over the channel returned by
//! [`MutationOrchestrator::new`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::ErrorCode;
use crate::model::{NewTask, Status, Task, TaskPatch};
use crate::optimistic::{OptimisticTracker, UpdateCallbacks, UpdateError};
use crate::store::{StoreError, TaskStore};
use crate::undo::{
    ActionType, BulkChange, ChangeHandler, ChangeId, ChangeMetadata, ChangeRecord, ReplayDirection,
    ReplayError, Snapshot, UndoRedoManager,
};
use crate::workflow::{Rejection, Verdict, WorkflowRuleSet, WorkflowValidator};

// ---------------------------------------------------------------------------
// Notices and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// A transient, dismissable message for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub code: Option<ErrorCode>,
}

impl Notice {
    fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
            code: None,
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
            code: None,
        }
    }

    fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
            code: Some(code),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("{0}")]
    Rejected(Rejection),

    #[error("task '{0}' is not on the board")]
    NotOnBoard(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

impl MutationError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Rejected(rejection) => rejection.code(),
            Self::NotOnBoard(_) => ErrorCode::TaskNotFound,
            Self::Store(err) => err.code(),
            Self::Replay(err) => err.code(),
        }
    }
}

// ---------------------------------------------------------------------------
// BoardSlice
// ---------------------------------------------------------------------------

/// The state of a few board entries; `None` means "not on the board".
///
/// This is what the optimistic tracker stores as original and desired data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardSlice(BTreeMap<String, Option<Task>>);

impl BoardSlice {
    /// Current state of `ids` on `board`.
    #[must_use]
    pub fn capture<'a>(
        board: &BTreeMap<String, Task>,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self(
            ids.into_iter()
                .map(|id| (id.to_string(), board.get(id).cloned()))
                .collect(),
        )
    }

    #[must_use]
    pub fn with(mut self, id: impl Into<String>, task: Option<Task>) -> Self {
        self.0.insert(id.into(), task);
        self
    }

    pub fn apply_to(&self, board: &mut BTreeMap<String, Task>) {
        for (id, entry) in &self.0 {
            match entry {
                Some(task) => {
                    board.insert(id.clone(), task.clone());
                }
                None => {
                    board.remove(id);
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.0.get(id).and_then(Option::as_ref)
    }
}

// ---------------------------------------------------------------------------
// Store-backed replay
// ---------------------------------------------------------------------------

/// Replays any recorded change against the task store.
///
/// Tasks only in `source` are deleted, tasks in both are overwritten with
/// the target state, tasks only in `target` are re-created under their
/// original id.
pub struct StoreReplayHandler<S> {
    store: Arc<S>,
}

impl<S> StoreReplayHandler<S> {
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: TaskStore + 'static> ChangeHandler for StoreReplayHandler<S> {
    async fn apply(
        &self,
        target: Option<&Snapshot>,
        source: Option<&Snapshot>,
        _metadata: &ChangeMetadata,
        _direction: ReplayDirection,
    ) -> anyhow::Result<()> {
        let targets: BTreeMap<&str, &Task> = target
            .map(Snapshot::tasks)
            .unwrap_or_default()
            .iter()
            .map(|t| (t.id.as_str(), t))
            .collect();
        let sources: BTreeMap<&str, &Task> = source
            .map(Snapshot::tasks)
            .unwrap_or_default()
            .iter()
            .map(|t| (t.id.as_str(), t))
            .collect();

        for id in sources.keys().filter(|id| !targets.contains_key(*id)) {
            self.store.delete_task(id).await?;
        }
        for (id, task) in &targets {
            match sources.get(id) {
                Some(current) => {
                    self.store
                        .update_task(id, TaskPatch::replace_with(Some(*current), task))
                        .await?;
                }
                None => {
                    self.store.create_task(NewTask::restoring(task)).await?;
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MutationOrchestrator
// ---------------------------------------------------------------------------

/// Owns the local board and the three reconciliation services for one
/// session. Construct once, drive from the UI, drop (or
/// [`reset_session`](Self::reset_session)) when done.
pub struct MutationOrchestrator<S> {
    store: Arc<S>,
    validator: WorkflowValidator,
    tracker: OptimisticTracker<BoardSlice>,
    history: UndoRedoManager,
    board: BTreeMap<String, Task>,
    notices: UnboundedSender<Notice>,
    clock: Arc<dyn Clock>,
}

impl<S: TaskStore + 'static> MutationOrchestrator<S> {
    /// Build an orchestrator with the standard workflow rules.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        config: &CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, UnboundedReceiver<Notice>) {
        let rules = WorkflowRuleSet::standard(config.workflow.review_dwell());
        Self::with_rules(store, rules, config, clock)
    }

    #[must_use]
    pub fn with_rules(
        store: Arc<S>,
        rules: WorkflowRuleSet,
        config: &CoreConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, UnboundedReceiver<Notice>) {
        let (tx, rx) = unbounded_channel();
        let mut history = UndoRedoManager::new(Arc::clone(&clock), &config.history);
        let replay: Arc<dyn ChangeHandler> = Arc::new(StoreReplayHandler::new(Arc::clone(&store)));
        for action in ActionType::ALL {
            history.register_change_handler(action, Arc::clone(&replay));
        }

        let orchestrator = Self {
            validator: WorkflowValidator::new(Arc::new(rules), Arc::clone(&clock)),
            tracker: OptimisticTracker::new(Arc::clone(&clock), &config.optimistic),
            history,
            board: BTreeMap::new(),
            notices: tx,
            store,
            clock,
        };
        (orchestrator, rx)
    }

    /// Replace the local board with tasks fetched by the caller.
    pub fn load_board(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.board = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
    }

    #[must_use]
    pub const fn board(&self) -> &BTreeMap<String, Task> {
        &self.board
    }

    #[must_use]
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.board.get(id)
    }

    #[must_use]
    pub const fn history(&self) -> &UndoRedoManager {
        &self.history
    }

    #[must_use]
    pub const fn tracker(&self) -> &OptimisticTracker<BoardSlice> {
        &self.tracker
    }

    #[must_use]
    pub const fn validator(&self) -> &WorkflowValidator {
        &self.validator
    }

    /// Forget all history and pending bookkeeping; the board is kept.
    pub fn reset_session(&mut self) {
        self.history.clear();
        self.tracker.clear();
    }

    // -- mutations ----------------------------------------------------------

    /// Create a task.
    ///
    /// # Errors
    ///
    /// [`MutationError::Store`] when the store refuses; the placeholder is
    /// removed from the board.
    pub async fn create_task(&mut self, draft: NewTask) -> Result<Task, MutationError> {
        let placeholder_id = format!("pending-{}", self.tracker.generate_tracking_id());
        let placeholder = draft.clone().into_task(placeholder_id.clone(), self.clock.now());
        let label = format!("create task \"{}\"", draft.title);

        let before = BoardSlice::default().with(placeholder_id.clone(), None);
        let desired = BoardSlice::default().with(placeholder_id.clone(), Some(placeholder));
        let store = Arc::clone(&self.store);
        let created = self
            .commit(
                label,
                before,
                desired,
                async move { store.create_task(draft).await },
                |task: &Task| {
                    BoardSlice::default()
                        .with(placeholder_id, None)
                        .with(task.id.clone(), Some(task.clone()))
                },
            )
            .await?;

        self.history.record_task_creation(&created);
        Ok(created)
    }

    /// Apply `patch` to a task. A status change in the patch is validated
    /// first.
    ///
    /// # Errors
    ///
    /// [`MutationError::Rejected`] for an illegal status change,
    /// [`MutationError::Store`] when the store refuses.
    pub async fn update_task(&mut self, id: &str, patch: TaskPatch) -> Result<Task, MutationError> {
        let current = self.on_board(id)?;
        if let Some(status) = patch.status.filter(|s| *s != current.status) {
            self.ensure_allowed(&current, status).await?;
        }
        let updated = self.commit_patch(&current, patch).await?;
        self.history.record_task_update(&current, &updated);
        Ok(updated)
    }

    /// Move a task to another column.
    ///
    /// # Errors
    ///
    /// As for [`update_task`](Self::update_task).
    pub async fn change_status(&mut self, id: &str, status: Status) -> Result<Task, MutationError> {
        let current = self.on_board(id)?;
        self.ensure_allowed(&current, status).await?;
        let moved = self.commit_patch(&current, TaskPatch::status(status)).await?;
        self.history.record_task_move(&current, &moved);
        Ok(moved)
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// [`MutationError::Store`] when the store refuses; the task reappears.
    pub async fn delete_task(&mut self, id: &str) -> Result<(), MutationError> {
        let current = self.on_board(id)?;
        let label = format!("delete task \"{}\"", current.title);
        let before = BoardSlice::capture(&self.board, [id]);
        let desired = BoardSlice::default().with(id, None);
        let store = Arc::clone(&self.store);
        let owned_id = id.to_string();
        self.commit(
            label,
            before,
            desired.clone(),
            async move { store.delete_task(&owned_id).await },
            |_: &()| desired,
        )
        .await?;

        self.history.record_task_deletion(&current);
        Ok(())
    }

    /// Apply the same patch to several tasks as one undoable change.
    ///
    /// All status changes are validated before anything is applied. If the
    /// store fails part-way, tasks already written are reverted on a best
    /// effort basis and the whole board slice is restored.
    ///
    /// # Errors
    ///
    /// The first rejection or store failure.
    pub async fn bulk_update(
        &mut self,
        ids: &[&str],
        patch: TaskPatch,
    ) -> Result<Vec<Task>, MutationError> {
        let originals = ids
            .iter()
            .map(|id| self.on_board(id))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(status) = patch.status {
            for task in originals.iter().filter(|t| t.status != status) {
                self.ensure_allowed(task, status).await?;
            }
        }

        let label = format!("update {} tasks", originals.len());
        let before = BoardSlice::capture(&self.board, ids.iter().copied());
        let desired = originals.iter().fold(BoardSlice::default(), |slice, t| {
            slice.with(t.id.clone(), Some(t.patched(&patch)))
        });
        let store = Arc::clone(&self.store);
        let batch = originals.clone();
        let change = patch.clone();
        let updated = self
            .commit(
                label,
                before,
                desired,
                async move { bulk_write(&*store, &batch, &change).await },
                |tasks: &Vec<Task>| {
                    tasks.iter().fold(BoardSlice::default(), |slice, t| {
                        slice.with(t.id.clone(), Some(t.clone()))
                    })
                },
            )
            .await?;

        self.history
            .record_bulk_operation(&originals, &BulkChange::Update(patch));
        Ok(updated)
    }

    /// Move several tasks to `status` as one undoable change.
    ///
    /// # Errors
    ///
    /// As for [`bulk_update`](Self::bulk_update).
    pub async fn bulk_update_status(
        &mut self,
        ids: &[&str],
        status: Status,
    ) -> Result<Vec<Task>, MutationError> {
        self.bulk_update(ids, TaskPatch::status(status)).await
    }

    /// Delete several tasks as one undoable change.
    ///
    /// # Errors
    ///
    /// The first store failure; already-deleted tasks are re-created on a
    /// best effort basis and the board slice is restored.
    pub async fn bulk_delete(&mut self, ids: &[&str]) -> Result<(), MutationError> {
        let originals = ids
            .iter()
            .map(|id| self.on_board(id))
            .collect::<Result<Vec<_>, _>>()?;

        let label = format!("delete {} tasks", originals.len());
        let before = BoardSlice::capture(&self.board, ids.iter().copied());
        let desired = ids
            .iter()
            .fold(BoardSlice::default(), |slice, id| slice.with(*id, None));
        let store = Arc::clone(&self.store);
        let batch = originals.clone();
        self.commit(
            label,
            before,
            desired.clone(),
            async move { bulk_remove(&*store, &batch).await },
            |_: &()| desired,
        )
        .await?;

        self.history.record_bulk_operation(&originals, &BulkChange::Delete);
        Ok(())
    }

    // -- undo / redo --------------------------------------------------------

    /// Undo the latest committed change and re-sync the affected tasks.
    ///
    /// # Errors
    ///
    /// [`MutationError::Replay`] when the store refuses the compensating
    /// writes. The change then sits on the redo stack.
    pub async fn undo(&mut self) -> Result<Option<ChangeRecord>, MutationError> {
        let outcome = self.history.undo().await;
        self.after_replay(outcome, "Undo").await
    }

    /// Redo the latest undone change and re-sync the affected tasks.
    ///
    /// # Errors
    ///
    /// [`MutationError::Replay`] when the store refuses; the change then sits
    /// on the undo stack.
    pub async fn redo(&mut self) -> Result<Option<ChangeRecord>, MutationError> {
        let outcome = self.history.redo().await;
        self.after_replay(outcome, "Redo").await
    }

    /// Sweep expired pending updates. Under the rollback policy their
    /// original state is put back on the board.
    pub fn expire_stale(&mut self) -> usize {
        let expired = self.tracker.expire_stale();
        let count = expired.len();
        for entry in expired {
            entry.original.apply_to(&mut self.board);
        }
        count
    }

    // -- internals ----------------------------------------------------------

    fn on_board(&self, id: &str) -> Result<Task, MutationError> {
        self.board
            .get(id)
            .cloned()
            .ok_or_else(|| MutationError::NotOnBoard(id.to_string()))
    }

    async fn ensure_allowed(&self, task: &Task, status: Status) -> Result<(), MutationError> {
        match self
            .validator
            .validate_transition(&*self.store, task, status)
            .await?
        {
            Verdict::Allowed => Ok(()),
            Verdict::Rejected(rejection) => {
                self.notify(Notice::error(rejection.to_string(), rejection.code()));
                Err(MutationError::Rejected(rejection))
            }
        }
    }

    async fn commit_patch(
        &mut self,
        current: &Task,
        patch: TaskPatch,
    ) -> Result<Task, MutationError> {
        let label = format!("update task \"{}\"", current.title);
        let before = BoardSlice::capture(&self.board, [current.id.as_str()]);
        let desired =
            BoardSlice::default().with(current.id.clone(), Some(current.patched(&patch)));
        let store = Arc::clone(&self.store);
        let id = current.id.clone();
        self.commit(
            label,
            before,
            desired,
            async move { store.update_task(&id, patch).await },
            |task: &Task| BoardSlice::default().with(task.id.clone(), Some(task.clone())),
        )
        .await
    }

    /// Steps 2 to 4 of the pipeline for one store call.
    async fn commit<T, Fut>(
        &mut self,
        label: String,
        before: BoardSlice,
        desired: BoardSlice,
        call: Fut,
        server_slice: impl FnOnce(&T) -> BoardSlice,
    ) -> Result<T, MutationError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let tracking_id = self.tracker.generate_tracking_id();
        let callbacks = self.callbacks(&label);
        desired.apply_to(&mut self.board);
        self.tracker
            .track_update(tracking_id.clone(), before.clone(), desired, callbacks);

        match call.await {
            Ok(value) => {
                let confirmed = server_slice(&value);
                if !self.tracker.confirm_update(&tracking_id, &confirmed) {
                    // Expired first: drop any held rollback so the store's
                    // answer is not undone by a later sweep.
                    self.tracker.forget(&tracking_id);
                    tracing::debug!(%tracking_id, "store confirmed after tracking expired");
                    self.notify(Notice::success(capitalize(&label)));
                }
                confirmed.apply_to(&mut self.board);
                Ok(value)
            }
            Err(err) => {
                let update_error = UpdateError::Store(err.clone());
                match self.tracker.rollback_update(&tracking_id, &update_error) {
                    Some(original) => original.apply_to(&mut self.board),
                    None => {
                        // A held rollback already reported the expiry.
                        if !self.tracker.forget(&tracking_id) {
                            let message = format!("Could not {label}: {update_error}");
                            self.notify(Notice::error(message, update_error.code()));
                        }
                        before.apply_to(&mut self.board);
                    }
                }
                Err(err.into())
            }
        }
    }

    fn callbacks(&self, label: &str) -> UpdateCallbacks<BoardSlice> {
        let ok_tx = self.notices.clone();
        let err_tx = self.notices.clone();
        let ok_label = capitalize(label);
        let err_label = label.to_string();
        UpdateCallbacks::none()
            .on_success(move |_: &BoardSlice| {
                let _ = ok_tx.send(Notice::success(ok_label));
            })
            .on_error(move |error: &UpdateError, _: &BoardSlice| {
                let message = format!("Could not {err_label}: {error}");
                let _ = err_tx.send(Notice::error(message, error.code()));
            })
    }

    async fn after_replay(
        &mut self,
        outcome: Result<Option<ChangeRecord>, ReplayError>,
        verb: &str,
    ) -> Result<Option<ChangeRecord>, MutationError> {
        match outcome {
            Ok(Some(record)) => {
                self.refresh(&record.metadata().task_ids).await;
                self.notify(Notice::info(format!("{verb}: {}", record.description())));
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                self.notify(Notice::error(err.to_string(), err.code()));
                let ids = self.replayed_task_ids(&err.change_id);
                self.refresh(&ids).await;
                Err(err.into())
            }
        }
    }

    /// Task ids of a record that just replayed, wherever it now sits.
    fn replayed_task_ids(&self, change_id: &ChangeId) -> Vec<String> {
        [self.history.peek_undo(), self.history.peek_redo()]
            .into_iter()
            .flatten()
            .find(|record| record.id() == change_id)
            .map(|record| record.metadata().task_ids.clone())
            .unwrap_or_default()
    }

    /// Re-read `ids` from the store so the board matches it after a replay.
    async fn refresh(&mut self, ids: &[String]) {
        for id in ids {
            match self.store.get_task(id).await {
                Ok(task) => {
                    self.board.insert(id.clone(), task);
                }
                Err(StoreError::NotFound(_)) => {
                    self.board.remove(id);
                }
                Err(err) => {
                    tracing::warn!(task_id = %id, error = %err, "could not refresh task after replay");
                }
            }
        }
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

async fn bulk_write<S: TaskStore + ?Sized>(
    store: &S,
    tasks: &[Task],
    patch: &TaskPatch,
) -> Result<Vec<Task>, StoreError> {
    let mut written: Vec<Task> = Vec::with_capacity(tasks.len());
    for original in tasks {
        match store.update_task(&original.id, patch.clone()).await {
            Ok(task) => written.push(task),
            Err(err) => {
                for (done, before) in written.iter().zip(tasks) {
                    if let Err(revert) = store
                        .update_task(&done.id, TaskPatch::replace_with(Some(done), before))
                        .await
                    {
                        tracing::warn!(task_id = %done.id, error = %revert, "could not revert partial bulk update");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(written)
}

async fn bulk_remove<S: TaskStore + ?Sized>(store: &S, tasks: &[Task]) -> Result<(), StoreError> {
    for (index, task) in tasks.iter().enumerate() {
        if let Err(err) = store.delete_task(&task.id).await {
            for task in &tasks[..index] {
                if let Err(revert) = store.create_task(NewTask::restoring(task)).await {
                    tracing::warn!(task_id = %task.id, error = %revert, "could not restore partially deleted task");
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}
