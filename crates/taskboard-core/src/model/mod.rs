//! Task entities as seen by the reconciliation core.
//!
//! The task store owns these values; the core only snapshots, compares and
//! patches them.

pub mod task;

pub use task::{NewTask, ParseEnumError, Priority, Status, Task, TaskPatch};
