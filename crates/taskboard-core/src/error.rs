use std::fmt;

/// Machine-readable error codes surfaced alongside user-facing notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    TaskNotFound,
    TransitionNotAllowed,
    BlockedByDependencies,
    WorkflowRuleViolated,
    InvalidEnumValue,
    ReplayFailed,
    PendingUpdateExpired,
    StoreUnavailable,
    StoreRejected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::TaskNotFound => "E2001",
            Self::TransitionNotAllowed => "E2002",
            Self::BlockedByDependencies => "E2003",
            Self::WorkflowRuleViolated => "E2004",
            Self::InvalidEnumValue => "E2005",
            Self::ReplayFailed => "E4001",
            Self::PendingUpdateExpired => "E4002",
            Self::StoreUnavailable => "E5001",
            Self::StoreRejected => "E5002",
        }
    }

    /// Short human-facing summary for logs and toasts.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::TaskNotFound => "Task not found",
            Self::TransitionNotAllowed => "Status transition not allowed",
            Self::BlockedByDependencies => "Task is blocked by unfinished tasks",
            Self::WorkflowRuleViolated => "Workflow rule violated",
            Self::InvalidEnumValue => "Invalid status/priority value",
            Self::ReplayFailed => "Undo/redo did not complete",
            Self::PendingUpdateExpired => "Change was not confirmed in time",
            Self::StoreUnavailable => "Task store unavailable",
            Self::StoreRejected => "Task store rejected the change",
        }
    }

    /// Optional remediation hint.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .taskboard/config.toml and retry."),
            Self::TaskNotFound => Some("Refresh the board; the task may have been deleted."),
            Self::TransitionNotAllowed => {
                Some("Follow the board flow: todo -> in_progress -> review -> done.")
            }
            Self::BlockedByDependencies => Some("Finish the blocking tasks first."),
            Self::WorkflowRuleViolated | Self::InvalidEnumValue => None,
            Self::ReplayFailed => Some("Try the undo/redo again once the connection recovers."),
            Self::PendingUpdateExpired => Some("Refresh the board to see the server's state."),
            Self::StoreUnavailable => Some("Check the connection and retry."),
            Self::StoreRejected => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
