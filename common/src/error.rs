use thiserror::Error;

/// Errors raised by the failover monitor's library crates.
///
/// Probe results and SQL statement outcomes are deliberately absent: an
/// unreachable host or a failed statement is a value the controller acts on,
/// not an error it propagates.
#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed state file at line {line}: {message}")]
    StateParse { line: usize, message: String },

    #[error("Persisted state does not match topology: {0}")]
    StateMismatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Invalid role assignment: {0}")]
    InvalidAssignment(String),
}

impl FailoverError {
    pub fn state_parse(line: usize, message: impl Into<String>) -> Self {
        Self::StateParse {
            line,
            message: message.into(),
        }
    }

    /// Whether this error came from reading or writing the state file.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::StateParse { .. } | Self::StateMismatch(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FailoverError>;
