use thiserror::Error;

/// Rejections raised at the document model boundary.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("object id must not be empty")]
    EmptyId,

    #[error("object id {0:?} contains the reserved '/' separator")]
    ReservedSeparator(String),

    #[error("group {0} must reference at least one shape")]
    EmptyGroup(String),

    #[error("unknown shape type: {0}")]
    UnknownShapeType(String),

    #[error("invalid object data: {0}")]
    InvalidData(#[from] serde_json::Error),
}
