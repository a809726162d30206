//! Error types for aggregation requests

use thiserror::Error;

use crate::repository::StoreError;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("invalid aggregation request: {0}")]
    InvalidRequest(String),

    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

impl AggregationError {
    /// Storage failures may succeed on a later attempt; bad requests will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AggregationError::Storage(_))
    }
}
