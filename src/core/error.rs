use std::path::PathBuf;

/// Why a step plan could not be produced or reused.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("unsupported disc type: {0}")]
    UnsupportedDiscType(String),

    #[error("step plan for disc type {0} is empty")]
    Empty(String),

    #[error("step {index} has an empty command")]
    EmptyCommand { index: usize },

    #[error("resumed plan does not match the recorded steps: {0}")]
    Mismatch(String),
}

/// Failures of a single step's external process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {status}")]
    NonZeroExit { program: String, status: String },

    #[error("I/O error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors surfaced to callers of the registries and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} is not resumable: {reason}")]
    NotResumable { id: String, reason: String },

    #[error("job {0} is already active")]
    AlreadyActive(String),

    #[error("drive {0} is not available")]
    DriveUnavailable(String),

    #[error("snapshot {path} could not be written: {source}")]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
