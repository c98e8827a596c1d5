use drift_core::FileId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("document not open: {0}")]
    DocumentNotOpen(FileId),
    #[error("invalid range")]
    InvalidRange,
}
