//! Storage errors (`spec.md` §7): invalid key shape, initialization state,
//! or corruption — surfaced synchronously, never absorbed.

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("invalid key: {0}")]
    InvalidKey(#[from] crate::key::KeyError),
    #[error("invalid blob key: {0}")]
    InvalidBlobKey(String),
    #[error("store not initialized")]
    NotInitialized,
    #[error("requested timestamp predates the base snapshot")]
    TimestampBeforeBaseSnapshot,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl error_kind::Classify for WalError {
    fn kind(&self) -> error_kind::ErrorKind {
        error_kind::ErrorKind::Storage
    }
}
