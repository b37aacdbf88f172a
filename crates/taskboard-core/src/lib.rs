//! taskboard-core library.
//!
//! Client-side reconciliation for a kanban task board: workflow validation,
//! optimistic updates and undo/redo history, tied together by
//! [`orchestrator::MutationOrchestrator`].
//!
//! # Conventions
//!
//! - **Errors**: Library operations return typed `thiserror` enums carrying
//!   an [`ErrorCode`]; `anyhow::Result` is used at the config and replay
//!   handler edges.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`)
//!   with structured fields.

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod optimistic;
pub mod orchestrator;
pub mod store;
pub mod undo;
pub mod workflow;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CoreConfig, load_config};
pub use error::ErrorCode;
pub use model::{NewTask, Priority, Status, Task, TaskPatch};
pub use optimistic::{ExpiryPolicy, OptimisticTracker, TrackingId, UpdateCallbacks, UpdateError};
pub use orchestrator::{MutationError, MutationOrchestrator, Notice, NoticeLevel};
pub use store::{CompletionCheck, InMemoryTaskStore, StoreError, TaskStore};
pub use undo::{ActionType, ChangeHandler, ChangeRecord, UndoRedoManager};
pub use workflow::{Rejection, Verdict, WorkflowRuleSet, WorkflowValidator};
