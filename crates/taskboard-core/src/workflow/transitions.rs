//! Directed reachability graph over task statuses.
//!
//! The default board flow:
//!
//! | From | Directly reachable |
//! |---|---|
//! | `todo` | `in_progress` |
//! | `in_progress` | `review`, `todo` |
//! | `review` | `done`, `in_progress` |
//! | `done` | `review` |
//!
//! `done` can be reopened into review but is never entered straight from
//! `todo` or `in_progress`.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusGraph {
    edges: BTreeMap<Status, BTreeSet<Status>>,
}

impl StatusGraph {
    /// A graph with no edges; every transition is rejected.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            edges: BTreeMap::new(),
        }
    }

    /// Add the edge `from -> to`.
    #[must_use]
    pub fn with_edge(mut self, from: Status, to: Status) -> Self {
        self.edges.entry(from).or_default().insert(to);
        self
    }

    /// Add `from -> to` for every `to` in `targets`.
    #[must_use]
    pub fn with_edges(self, from: Status, targets: impl IntoIterator<Item = Status>) -> Self {
        targets
            .into_iter()
            .fold(self, |graph, to| graph.with_edge(from, to))
    }

    /// Whether `to` is directly reachable from `from`.
    #[must_use]
    pub fn allows(&self, from: Status, to: Status) -> bool {
        self.edges.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// Statuses directly reachable from `from`, in board order.
    #[must_use]
    pub fn reachable_from(&self, from: Status) -> Vec<Status> {
        self.edges
            .get(&from)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for StatusGraph {
    fn default() -> Self {
        Self::empty()
            .with_edge(Status::Todo, Status::InProgress)
            .with_edges(Status::InProgress, [Status::Review, Status::Todo])
            .with_edges(Status::Review, [Status::Done, Status::InProgress])
            .with_edge(Status::Done, Status::Review)
    }
}
