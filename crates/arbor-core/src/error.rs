use thiserror::Error;

use crate::ids::WorkId;

#[derive(Debug, Error)]
pub enum ArborError {
    #[error("duplicate child work '{name}' under '{parent}'")]
    DuplicateChild { parent: String, name: String },

    #[error("work not found: {0}")]
    WorkNotFound(WorkId),

    #[error("{0}")]
    Other(String),
}
