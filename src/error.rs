//! Error taxonomy.
//!
//! Everything the submitted code can cause is reported as data through
//! [`ErrorKind`] in an `ExecutionResult`. Only [`SandboxFault`], a failure
//! of the sandbox's own machinery, is returned as an `Err`.

use std::fmt;

/// The `error_type` of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The code does not parse.
    SyntaxInvalid,
    /// The analyzer found a forbidden import, call or attribute.
    SecurityError,
    /// Wall-clock or CPU ceiling reached.
    TimeoutError,
    /// Memory ceiling reached.
    MemoryLimitError,
    /// The request itself is out of bounds.
    InvalidRequest,
    /// The caller cancelled the execution.
    Cancelled,
    /// The child died without reporting, for a reason other than a limit.
    ProcessCrashed,
    /// An exception raised by the user's code, by class name.
    User(String),
}

impl ErrorKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SyntaxInvalid => "SyntaxInvalid",
            Self::SecurityError => "SecurityError",
            Self::TimeoutError => "TimeoutError",
            Self::MemoryLimitError => "MemoryLimitError",
            Self::InvalidRequest => "InvalidRequest",
            Self::Cancelled => "Cancelled",
            Self::ProcessCrashed => "ProcessCrashed",
            Self::User(name) => name,
        }
    }

    /// Rejected before anything was spawned.
    pub const fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            Self::SyntaxInvalid | Self::SecurityError | Self::InvalidRequest
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The isolation machinery failed; the submitted code is not to blame.
#[derive(Debug, thiserror::Error)]
pub enum SandboxFault {
    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child protocol error: {0}")]
    Protocol(String),

    #[error("child setup failed: {0}")]
    Setup(String),

    #[error("worker failed: {0}")]
    Worker(String),
}
