use thiserror::Error;

/// How a failure is classified for operators.
///
/// - `Conflict` / `TaskProcessing`: recovered locally (retry, or recorded on the task)
/// - `NotFound` / `Submission` / `Fatal`: surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Conflict,
    NotFound,
    TaskProcessing,
    Submission,
    Fatal,
}

/// Why a submission backend refused to launch a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitErrorKind {
    /// The remote host rejected our credentials.
    Authentication,
    /// The resource manager refused the job (bad script, queue limits, ...).
    Rejected,
    /// The launch executable or endpoint could not be reached at all.
    Unreachable,
}

impl std::fmt::Display for SubmitErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubmitErrorKind::Authentication => "authentication failed",
            SubmitErrorKind::Rejected => "rejected by resource manager",
            SubmitErrorKind::Unreachable => "launcher unreachable",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("document {id} was modified concurrently")]
    Conflict { id: String },

    #[error("document {0} not found")]
    NotFound(String),

    #[error("document {id} is in an impossible state: {reason}")]
    InvalidState { id: String, reason: String },

    #[error("cannot {transition} {id}: {reason}")]
    InvalidTransition {
        id: String,
        transition: &'static str,
        reason: String,
    },

    #[error("view '{0}' cannot be used here")]
    InvalidView(String),

    #[error("{operation} on {id} still conflicting after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        id: String,
        attempts: u32,
    },

    #[error("submission to {host} failed ({kind}): {message}")]
    Submission {
        host: String,
        kind: SubmitErrorKind,
        message: String,
    },

    #[error("task processing failed: {0}")]
    TaskFailed(String),

    #[error("document store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PilotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PilotError::Conflict { .. } => ErrorKind::Conflict,
            PilotError::NotFound(_) => ErrorKind::NotFound,
            PilotError::TaskFailed(_) => ErrorKind::TaskProcessing,
            PilotError::Submission { .. } => ErrorKind::Submission,
            _ => ErrorKind::Fatal,
        }
    }

    /// Whether the failure is expected under concurrency and handled locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::TaskProcessing)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PilotError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PilotError::NotFound(_))
    }
}

impl From<reqwest::Error> for PilotError {
    fn from(err: reqwest::Error) -> Self {
        PilotError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PilotError>;
