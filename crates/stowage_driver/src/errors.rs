use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("upload session for {0} could not be repaired")]
    RepairFailed(String),

    #[error("chunk size {chunk_size} is smaller than the backend minimum of {min_chunk_size}")]
    InvalidChunkSize { chunk_size: u64, min_chunk_size: u64 },

    #[error("invalid path {path}: {source}")]
    InvalidPath {
        path: String,
        source: stowage_objectstore::Error,
    },

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("objectstore error: {0}")]
    ObjectStoreError(#[from] stowage_objectstore::Error),
}

impl Error {
    /// Rewrite backend "not found" responses into [`Error::PathNotFound`] for `path`.
    pub(crate) fn for_path(self, path: &str) -> Error {
        match self {
            Error::ObjectStoreError(e) if e.is_not_found() => Error::PathNotFound(path.to_string()),
            Error::PathNotFound(_) => Error::PathNotFound(path.to_string()),
            e => e,
        }
    }
}

/// Returned by writer operations attempted after the writer reached a terminal state.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("already closed")]
    Closed,
    #[error("already committed")]
    Committed,
    #[error("already cancelled")]
    Cancelled,
}
