use thiserror::Error;

/// Coarse error classes shared by every unit; propagation policy keys off
/// these rather than concrete variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed message material: bad anchor/target length, schema failure.
    IllFormed,
    /// Network failure, timeout, or upstream 5xx. Retriable.
    Transient,
    /// 404 from a store or gateway.
    NotFound,
    /// Duplicate insert; idempotent callers treat this as success.
    Conflict,
    /// Error reported by the process itself; recorded, never halts the chain.
    Deterministic,
    /// Store corruption, signature failure, unrecoverable I/O.
    Fatal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("ill-formed message: {0}")]
    IllFormed(String),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("signing failure: {0}")]
    Signing(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::IllFormed(_) | CoreError::Codec(_) => ErrorKind::IllFormed,
            CoreError::Signing(_) => ErrorKind::Fatal,
        }
    }
}
