//! Workflow transition validation.
//!
//! ## Submodules
//!
//! - [`transitions`] - directed graph of legal status moves.
//! - [`rules`] - ordered declarative rules and the rule set container.
//! - [`validator`] - [`WorkflowValidator`], combining both with the store's
//!   dependency gate.

pub mod rules;
pub mod transitions;
pub mod validator;

pub use rules::{REVIEW_DWELL_RULE, RuleContext, WorkflowRule, WorkflowRuleSet};
pub use transitions::StatusGraph;
pub use validator::{Rejection, Verdict, WorkflowValidator};
