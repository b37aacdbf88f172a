//! Replay handlers, one slot per [`ActionType`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use super::record::{ActionType, ChangeMetadata, Snapshot};

/// Which way a change is being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayDirection {
    Undo,
    Redo,
}

impl ReplayDirection {
    #[must_use]
    pub const fn is_undo(self) -> bool {
        matches!(self, Self::Undo)
    }
}

/// Re-applies a recorded change.
///
/// `target` is the state to arrive at and `source` the state being left:
/// on undo `target` is the record's previous state, on redo its new state.
/// A `None` target means the entity should not exist afterwards (undoing a
/// creation, redoing a deletion); a `None` source means it does not exist
/// yet.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn apply(
        &self,
        target: Option<&Snapshot>,
        source: Option<&Snapshot>,
        metadata: &ChangeMetadata,
        direction: ReplayDirection,
    ) -> anyhow::Result<()>;
}

/// Registered handlers. Each [`ActionType`] maps to its own slot by an
/// exhaustive match, so a new kind cannot be added without a slot.
#[derive(Clone, Default)]
pub struct HandlerTable {
    create_task: Option<Arc<dyn ChangeHandler>>,
    update_task: Option<Arc<dyn ChangeHandler>>,
    delete_task: Option<Arc<dyn ChangeHandler>>,
    bulk_update: Option<Arc<dyn ChangeHandler>>,
    move_task: Option<Arc<dyn ChangeHandler>>,
}

impl HandlerTable {
    const fn slot(&self, action: ActionType) -> &Option<Arc<dyn ChangeHandler>> {
        match action {
            ActionType::CreateTask => &self.create_task,
            ActionType::UpdateTask => &self.update_task,
            ActionType::DeleteTask => &self.delete_task,
            ActionType::BulkUpdate => &self.bulk_update,
            ActionType::MoveTask => &self.move_task,
        }
    }

    fn slot_mut(&mut self, action: ActionType) -> &mut Option<Arc<dyn ChangeHandler>> {
        match action {
            ActionType::CreateTask => &mut self.create_task,
            ActionType::UpdateTask => &mut self.update_task,
            ActionType::DeleteTask => &mut self.delete_task,
            ActionType::BulkUpdate => &mut self.bulk_update,
            ActionType::MoveTask => &mut self.move_task,
        }
    }

    /// Install `handler` for `action`, returning whatever it replaced.
    pub fn register(
        &mut self,
        action: ActionType,
        handler: Arc<dyn ChangeHandler>,
    ) -> Option<Arc<dyn ChangeHandler>> {
        self.slot_mut(action).replace(handler)
    }

    pub fn unregister(&mut self, action: ActionType) -> Option<Arc<dyn ChangeHandler>> {
        self.slot_mut(action).take()
    }

    #[must_use]
    pub fn get(&self, action: ActionType) -> Option<Arc<dyn ChangeHandler>> {
        self.slot(action).clone()
    }

    #[must_use]
    pub const fn contains(&self, action: ActionType) -> bool {
        self.slot(action).is_some()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<ActionType> = ActionType::ALL
            .into_iter()
            .filter(|action| self.contains(*action))
            .collect();
        f.debug_struct("HandlerTable")
            .field("registered", &registered)
            .finish()
    }
}
