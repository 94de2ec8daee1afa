use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to read {count} bytes from target address {address:#x}")]
    MemoryReadFailed { address: u64, count: usize },

    #[error("failed to write {count} bytes to target address {address:#x}")]
    MemoryWriteFailed { address: u64, count: usize },

    #[error("failed to allocate {size} bytes in target: {message}")]
    AllocationFailed { size: usize, message: String },

    #[error("injection failed: {0}")]
    InjectionFailed(String),

    #[error("failed to open process {pid}: {message}")]
    ProcessOpenFailed { pid: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Check if this error reports a caller-side precondition violation.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Error::InvalidArgument(_))
    }

    /// Check if this error came from a failed or short memory copy.
    pub fn is_memory_error(&self) -> bool {
        matches!(
            self,
            Error::MemoryReadFailed { .. } | Error::MemoryWriteFailed { .. }
        )
    }
}
