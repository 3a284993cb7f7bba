use thiserror::Error;

use crate::core::TaskId;
use crate::session::SessionStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session {id} is {status} and cannot be modified")]
    SessionTerminal { id: String, status: SessionStatus },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decomposition failed: {0}")]
    Decomposition(String),

    #[error("Agent not available: {0}")]
    AgentNotAvailable(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider binary not found: {0}")]
    ProviderBinaryNotFound(String),

    #[error("Turn budget exhausted for session {0}")]
    BudgetExhausted(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Dependency deadlock, halted tasks: {0:?}")]
    DependencyDeadlock(Vec<TaskId>),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::NoHomeDir), "No home directory");
        assert_eq!(
            format!("{}", Error::Provider("exit 1".to_string())),
            "Provider error: exit 1"
        );
    }

    #[test]
    fn test_session_terminal_display() {
        let err = Error::SessionTerminal {
            id: "abc".to_string(),
            status: SessionStatus::Completed,
        };
        assert_eq!(
            err.to_string(),
            "Session abc is completed and cannot be modified"
        );
    }

    #[test]
    fn test_deadlock_lists_tasks() {
        let err = Error::DependencyDeadlock(vec![TaskId::from("testing")]);
        assert!(err.to_string().contains("testing"));
    }
}
