use std::fmt;
use std::sync::Arc;

use super::rules::{RuleContext, WorkflowRuleSet};
use crate::clock::Clock;
use crate::error::ErrorCode;
use crate::model::{Status, Task};
use crate::store::{StoreError, TaskStore};

/// Why a proposed transition was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No direct edge `from -> to` in the status graph.
    TransitionNotAllowed { from: Status, to: Status },
    /// Moving to done while other tasks still block this one.
    Blocked { blocking_titles: Vec<String> },
    /// A declarative rule returned false.
    Rule { rule_id: String, message: String },
}

impl Rejection {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::TransitionNotAllowed { .. } => ErrorCode::TransitionNotAllowed,
            Self::Blocked { .. } => ErrorCode::BlockedByDependencies,
            Self::Rule { .. } => ErrorCode::WorkflowRuleViolated,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransitionNotAllowed { from, to } => {
                write!(f, "Cannot move task from {from} to {to}")
            }
            Self::Blocked { blocking_titles } => write!(
                f,
                "Cannot complete task. Blocked by: {}",
                blocking_titles.join(", ")
            ),
            Self::Rule { message, .. } => f.write_str(message),
        }
    }
}

/// Outcome of transition validation. A rejection is an ordinary result,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Rejected(Rejection),
}

impl Verdict {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    #[must_use]
    pub const fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Allowed => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

/// Gatekeeper consulted before any status change is applied or sent.
///
/// Checks run in a fixed order: graph reachability, then the dependency
/// gate (only when the target is `done`), then the declarative rules.
/// Validation never mutates the task.
#[derive(Debug, Clone)]
pub struct WorkflowValidator {
    rules: Arc<WorkflowRuleSet>,
    clock: Arc<dyn Clock>,
}

impl WorkflowValidator {
    #[must_use]
    pub fn new(rules: Arc<WorkflowRuleSet>, clock: Arc<dyn Clock>) -> Self {
        Self { rules, clock }
    }

    #[must_use]
    pub fn rules(&self) -> &WorkflowRuleSet {
        &self.rules
    }

    /// Graph and rule checks only, without asking the store about blockers.
    #[must_use]
    pub fn check_local(&self, task: &Task, proposed: Status) -> Verdict {
        if let Err(rejection) = self.check_reachable(task, proposed) {
            return Verdict::Rejected(rejection);
        }
        self.check_rules(task, proposed)
    }

    /// Full validation of `task.status -> proposed`.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the completion check itself fails. In
    /// that case the transition must not be attempted either.
    pub async fn validate_transition<S>(
        &self,
        store: &S,
        task: &Task,
        proposed: Status,
    ) -> Result<Verdict, StoreError>
    where
        S: TaskStore + ?Sized,
    {
        if let Err(rejection) = self.check_reachable(task, proposed) {
            return Ok(Verdict::Rejected(rejection));
        }

        if proposed == Status::Done {
            let check = store.can_complete_task(&task.id).await?;
            if !check.can_complete {
                let rejection = Rejection::Blocked {
                    blocking_titles: check.blocking_titles(),
                };
                tracing::debug!(task_id = %task.id, %rejection, "transition rejected");
                return Ok(Verdict::Rejected(rejection));
            }
        }

        Ok(self.check_rules(task, proposed))
    }

    fn check_reachable(&self, task: &Task, proposed: Status) -> Result<(), Rejection> {
        if self.rules.graph().allows(task.status, proposed) {
            return Ok(());
        }
        let rejection = Rejection::TransitionNotAllowed {
            from: task.status,
            to: proposed,
        };
        tracing::debug!(task_id = %task.id, %rejection, "transition rejected");
        Err(rejection)
    }

    fn check_rules(&self, task: &Task, proposed: Status) -> Verdict {
        let ctx = RuleContext {
            task,
            proposed,
            now: self.clock.now(),
        };
        match self.rules.first_violation(&ctx) {
            None => Verdict::Allowed,
            Some(rule) => {
                tracing::debug!(task_id = %task.id, rule = rule.id(), "workflow rule failed");
                Verdict::Rejected(Rejection::Rule {
                    rule_id: rule.id().to_string(),
                    message: rule.message().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{NewTask, Priority, TaskPatch};
    use crate::store::InMemoryTaskStore;
    use crate::workflow::rules::{REVIEW_DWELL_RULE, WorkflowRule};
    use chrono::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: InMemoryTaskStore,
        validator: WorkflowValidator,
    }

    fn fixture(rules: WorkflowRuleSet) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        Fixture {
            store: InMemoryTaskStore::new(clock.clone()),
            validator: WorkflowValidator::new(Arc::new(rules), clock.clone()),
            clock,
        }
    }

    fn standard() -> Fixture {
        fixture(WorkflowRuleSet::standard(Duration::minutes(5)))
    }

    async fn task_in(fx: &Fixture, status: Status, priority: Priority) -> Task {
        let draft = NewTask {
            status: Some(status),
            priority,
            ..NewTask::titled("Ship release")
        };
        fx.store.create_task(draft).await.unwrap()
    }

    #[tokio::test]
    async fn todo_to_in_progress_is_allowed() {
        let fx = standard();
        let task = task_in(&fx, Status::Todo, Priority::Medium).await;
        let verdict = fx
            .validator
            .validate_transition(&fx.store, &task, Status::InProgress)
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Allowed);
    }

    #[tokio::test]
    async fn todo_to_done_is_not_an_edge() {
        let fx = standard();
        let task = task_in(&fx, Status::Todo, Priority::Low).await;
        let verdict = fx
            .validator
            .validate_transition(&fx.store, &task, Status::Done)
            .await
            .unwrap();
        let rejection = verdict.rejection().expect("must be rejected");
        assert_eq!(
            *rejection,
            Rejection::TransitionNotAllowed {
                from: Status::Todo,
                to: Status::Done
            }
        );
        assert_eq!(rejection.to_string(), "Cannot move task from todo to done");
        assert_eq!(rejection.code(), ErrorCode::TransitionNotAllowed);
    }

    #[tokio::test]
    async fn fresh_high_priority_review_cannot_complete() {
        let fx = standard();
        let task = task_in(&fx, Status::Review, Priority::High).await;
        let verdict = fx
            .validator
            .validate_transition(&fx.store, &task, Status::Done)
            .await
            .unwrap();
        match verdict {
            Verdict::Rejected(Rejection::Rule { rule_id, message }) => {
                assert_eq!(rule_id, REVIEW_DWELL_RULE);
                assert!(message.contains("5 minutes"));
            }
            other => panic!("expected dwell rejection, got {other:?}"),
        }

        fx.clock.advance(Duration::minutes(5));
        let verdict = fx
            .validator
            .validate_transition(&fx.store, &task, Status::Done)
            .await
            .unwrap();
        assert!(verdict.is_allowed());
    }

    #[tokio::test]
    async fn blockers_are_reported_before_rules() {
        let fx = standard();
        let task = task_in(&fx, Status::Review, Priority::High).await;
        let blocker = fx
            .store
            .create_task(NewTask::titled("Migrate schema"))
            .await
            .unwrap();
        fx.store.add_blocker(&task.id, &blocker.id).await;

        let verdict = fx
            .validator
            .validate_transition(&fx.store, &task, Status::Done)
            .await
            .unwrap();
        let rejection = verdict.rejection().expect("must be rejected");
        assert_eq!(
            rejection.to_string(),
            "Cannot complete task. Blocked by: Migrate schema"
        );
    }

    #[tokio::test]
    async fn dependency_gate_only_runs_for_done() {
        let fx = standard();
        let task = task_in(&fx, Status::Review, Priority::Low).await;
        let blocker = fx.store.create_task(NewTask::titled("Dep")).await.unwrap();
        fx.store.add_blocker(&task.id, &blocker.id).await;
        fx.store
            .update_task(&blocker.id, TaskPatch::status(Status::InProgress))
            .await
            .unwrap();

        let verdict = fx
            .validator
            .validate_transition(&fx.store, &task, Status::InProgress)
            .await
            .unwrap();
        assert!(verdict.is_allowed());
    }

    #[tokio::test]
    async fn store_failure_is_an_error_not_a_rejection() {
        let fx = standard();
        let mut task = task_in(&fx, Status::Review, Priority::Low).await;
        task.id = "ghost".into();
        let err = fx
            .validator
            .validate_transition(&fx.store, &task, Status::Done)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn first_failing_rule_wins() {
        let rules = WorkflowRuleSet::standard(Duration::minutes(5))
            .with_rule(WorkflowRule::new("needs_assignee", "Assign the task first", |ctx| {
                ctx.task.assignee_id.is_some()
            }))
            .with_rule(WorkflowRule::new("needs_label", "Label the task first", |ctx| {
                !ctx.task.labels.is_empty()
            }));
        let fx = fixture(rules);
        let task = task_in(&fx, Status::Todo, Priority::Low).await;

        let verdict = fx.validator.check_local(&task, Status::InProgress);
        assert_eq!(
            verdict,
            Verdict::Rejected(Rejection::Rule {
                rule_id: "needs_assignee".into(),
                message: "Assign the task first".into(),
            })
        );
    }

    #[tokio::test]
    async fn validation_leaves_the_task_untouched() {
        let fx = standard();
        let task = task_in(&fx, Status::Review, Priority::High).await;
        let before = task.clone();
        let _ = fx
            .validator
            .validate_transition(&fx.store, &task, Status::Done)
            .await
            .unwrap();
        assert_eq!(task, before);
        assert_eq!(fx.store.get_task(&task.id).await.unwrap(), before);
    }
}
