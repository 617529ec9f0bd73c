//! Failure taxonomy shared by the pipeline and the query surface.

use thiserror::Error;

/// Errors with distinct handling policies.
///
/// Pipeline stages return these so the claim loop can tell apart
/// per-file failures (job -> failed), environmental failures (job stays
/// pending, worker backs off) and terminal media problems.
#[derive(Debug, Error)]
pub enum IngestError {
    /// On-disk path vanished between enumeration and processing.
    #[error("file missing on disk: {0}")]
    MissingFile(String),

    /// The decoder rejects the file; terminal until manual retry.
    #[error("unreadable media: {0}")]
    UnreadableMedia(String),

    /// Transient I/O or decoder error; the job fails and can be re-queued.
    #[error("stage failed: {0}")]
    StageTransient(String),

    /// A model host failed to load; the job goes back to pending.
    #[error("model not ready: {0}")]
    ModelNotReady(String),

    /// Concurrent write conflict; retried by the caller.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A query referenced an id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A query parameter was out of range or ill-typed.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

impl IngestError {
    /// Whether the enrichment job should return to `pending` rather than
    /// move to `failed`.
    pub fn keeps_job_pending(&self) -> bool {
        matches!(self, IngestError::ModelNotReady(_))
    }

    /// Whether a retry without operator intervention is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestError::UnreadableMedia(_) | IngestError::MissingFile(_)
        )
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
