//! Task store error type.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StoreError {
    /// Creating the root/waiting/running/tmp directories failed.
    InitFailed { path: PathBuf, source: std::io::Error },
    /// A record failed to serialize to its on-disk form.
    Encode(serde_json::Error),
    /// A mutation (write, rename, unlink) failed at the filesystem layer.
    Io { op: &'static str, path: PathBuf, source: std::io::Error },
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { op, path: path.into(), source }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InitFailed { path, source } => {
                write!(f, "failed to initialize task store at {}: {source}", path.display())
            }
            StoreError::Encode(e) => write!(f, "failed to encode task record: {e}"),
            StoreError::Io { op, path, source } => {
                write!(f, "{op} failed for {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::InitFailed { source, .. } => Some(source),
            StoreError::Encode(e) => Some(e),
            StoreError::Io { source, .. } => Some(source),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Encode(e)
    }
}
