use std::io;
use std::path::PathBuf;

use ao_core::{CoreError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CuError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("transient failure in {op}: {detail}")]
    Transient { op: &'static str, detail: String },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("duplicate record: {0}")]
    Conflict(String),
    #[error("schema violation at {boundary}: {detail}")]
    Schema {
        boundary: &'static str,
        detail: String,
    },
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CuError {
    pub fn transient(op: &'static str, detail: impl Into<String>) -> Self {
        CuError::Transient {
            op,
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CuError::NotFound { what: what.into() }
    }

    pub fn schema(boundary: &'static str, detail: impl ToString) -> Self {
        CuError::Schema {
            boundary,
            detail: detail.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CuError::Core(e) => e.kind(),
            CuError::Transient { .. } => ErrorKind::Transient,
            CuError::NotFound { .. } => ErrorKind::NotFound,
            CuError::Conflict(_) => ErrorKind::Conflict,
            CuError::Schema { .. } => ErrorKind::IllFormed,
            CuError::Io { .. } | CuError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Transient and not-found degrade gracefully at the checkpoint and
    /// cache layers; everything else propagates.
    pub fn is_degradable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::NotFound)
    }
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> CuError {
    CuError::Io {
        path: path.into(),
        source: err,
    }
}

pub type CuResult<T> = Result<T, CuError>;
