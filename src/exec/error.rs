use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorCode {
    PolicyViolation,
    NotFound,
    SessionInUse,
    SpawnFailure,
    TerminationFailure,
    PathNotAllowed,
    InvalidArgs,
    Internal,
}

impl ExecErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PolicyViolation => "policy_violation",
            Self::NotFound => "not_found",
            Self::SessionInUse => "session_in_use",
            Self::SpawnFailure => "spawn_failure",
            Self::TerminationFailure => "termination_failure",
            Self::PathNotAllowed => "path_not_allowed",
            Self::InvalidArgs => "invalid_args",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ExecErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ExecError {
    pub code: ExecErrorCode,
    pub message: String,
}

impl ExecError {
    pub fn new(code: ExecErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(session_id: &str) -> Self {
        Self::new(
            ExecErrorCode::NotFound,
            format!("no session found for {session_id}"),
        )
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
