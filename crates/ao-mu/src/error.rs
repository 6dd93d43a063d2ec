use std::io;
use std::path::PathBuf;

use ao_core::{CoreError, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("transient failure in {op}: {detail}")]
    Transient { op: &'static str, detail: String },
    #[error("{what} not found")]
    NotFound { what: String },
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

impl MuError {
    pub fn transient(op: &'static str, detail: impl Into<String>) -> Self {
        MuError::Transient {
            op,
            detail: detail.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        MuError::NotFound { what: what.into() }
    }

    pub fn schema(boundary: &'static str, detail: impl ToString) -> Self {
        MuError::Schema {
            boundary,
            detail: detail.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MuError::Core(e) => e.kind(),
            MuError::Transient { .. } => ErrorKind::Transient,
            MuError::NotFound { .. } => ErrorKind::NotFound,
            MuError::Schema { .. } => ErrorKind::IllFormed,
            MuError::Io { .. } | MuError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

pub(crate) fn io_error(path: impl Into<PathBuf>, err: io::Error) -> MuError {
    MuError::Io {
        path: path.into(),
        source: err,
    }
}

pub type MuResult<T> = Result<T, MuError>;
