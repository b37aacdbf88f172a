//! Declarative workflow rules.
//!
//! A [`WorkflowRuleSet`] pairs the [`StatusGraph`] with an ordered list of
//! [`WorkflowRule`]s. It is built once at startup and shared read-only.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;

use super::transitions::StatusGraph;
use crate::model::{Priority, Status, Task};

/// Rule id of the built-in review dwell rule.
pub const REVIEW_DWELL_RULE: &str = "high_priority_review_dwell";

/// Everything a rule predicate may look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub task: &'a Task,
    pub proposed: Status,
    pub now: DateTime<Utc>,
}

impl RuleContext<'_> {
    /// Time since the task was last written by the store.
    #[must_use]
    pub fn elapsed_since_update(&self) -> Duration {
        self.now - self.task.updated_at
    }
}

type Predicate = dyn Fn(&RuleContext<'_>) -> bool + Send + Sync;

/// A named predicate over `(task, proposed status)`.
///
/// The predicate returns `true` when the transition is acceptable.
#[derive(Clone)]
pub struct WorkflowRule {
    id: String,
    message: String,
    predicate: Arc<Predicate>,
}

impl WorkflowRule {
    pub fn new(
        id: impl Into<String>,
        message: impl Into<String>,
        predicate: impl Fn(&RuleContext<'_>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// High-priority tasks must sit in review for at least `dwell` before
    /// moving to done. Time in review is measured from `updated_at`.
    #[must_use]
    pub fn review_dwell(dwell: Duration) -> Self {
        let seconds = dwell.num_seconds();
        let (amount, unit) = if seconds % 60 == 0 {
            (seconds / 60, "minute")
        } else {
            (seconds, "second")
        };
        let message = format!(
            "High priority tasks must be in review for at least {amount} {unit}{} before completion",
            if amount == 1 { "" } else { "s" }
        );
        Self::new(REVIEW_DWELL_RULE, message, move |ctx| {
            if ctx.proposed != Status::Done
                || ctx.task.status != Status::Review
                || ctx.task.priority != Priority::High
            {
                return true;
            }
            ctx.elapsed_since_update() >= dwell
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn check(&self, ctx: &RuleContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl fmt::Debug for WorkflowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRule")
            .field("id", &self.id)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Transition graph plus ordered rules. Order matters: the first failing
/// rule is the one reported.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRuleSet {
    graph: StatusGraph,
    rules: Vec<WorkflowRule>,
}

impl WorkflowRuleSet {
    #[must_use]
    pub const fn new(graph: StatusGraph, rules: Vec<WorkflowRule>) -> Self {
        Self { graph, rules }
    }

    /// Default board graph with the review dwell rule.
    #[must_use]
    pub fn standard(review_dwell: Duration) -> Self {
        Self::new(
            StatusGraph::default(),
            vec![WorkflowRule::review_dwell(review_dwell)],
        )
    }

    /// Append a rule after all existing ones.
    #[must_use]
    pub fn with_rule(mut self, rule: WorkflowRule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub const fn graph(&self) -> &StatusGraph {
        &self.graph
    }

    #[must_use]
    pub fn rules(&self) -> &[WorkflowRule] {
        &self.rules
    }

    /// First rule that rejects `ctx`, if any. Later rules are not evaluated.
    #[must_use]
    pub fn first_violation(&self, ctx: &RuleContext<'_>) -> Option<&WorkflowRule> {
        self.rules.iter().find(|rule| !rule.check(ctx))
    }
}
