use thiserror::Error;

#[derive(Debug, Error)]
pub enum XenonError {
    #[error("Not a FATX volume: {0}")]
    NotFatx(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Cluster {0} out of range")]
    BadCluster(u32),

    #[error("Cluster chain ended early at cluster {0}")]
    BadChain(u32),

    #[error("Not enough free space: {0}")]
    NoSpace(String),

    #[error("No free table slots: {0}")]
    NoFreeSlots(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stream is read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid XDBF file: {0}")]
    InvalidXdbf(String),

    #[error("Section update failed: {0}")]
    UpdateFailed(String),

    #[error("Unsupported mode: {0}")]
    UnsupportedMode(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<XenonError> for std::io::Error {
    fn from(err: XenonError) -> Self {
        match err {
            XenonError::IoError(inner) => inner,
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
