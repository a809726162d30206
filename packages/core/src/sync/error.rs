//! Classified errors of a synchronization pass

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::remote::RemoteError;
use crate::repository::StoreError;

/// Coarse class of a sync failure, as recorded on the sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connectivity,
    Authentication,
    ObjectNotFound,
    StorageFull,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Authentication => "authentication",
            ErrorKind::ObjectNotFound => "object_not_found",
            ErrorKind::StorageFull => "storage_full",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the remaining sub-syncs of the pass are skipped.
    pub fn aborts_pass(self) -> bool {
        matches!(
            self,
            ErrorKind::Connectivity | ErrorKind::Authentication | ErrorKind::Cancelled
        )
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote unreachable: {0}")]
    Connectivity(String),

    #[error("credentials rejected: {0}")]
    Authentication(String),

    #[error("remote object not found: {0}")]
    ObjectNotFound(String),

    #[error("local storage is full")]
    StorageFull,

    #[error("sync cancelled")]
    Cancelled,

    #[error("malformed remote data: {0}")]
    Format(String),

    #[error("local storage error: {0}")]
    Storage(StoreError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connectivity(_) => ErrorKind::Connectivity,
            SyncError::Authentication(_) => ErrorKind::Authentication,
            SyncError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            SyncError::StorageFull => ErrorKind::StorageFull,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Format(_) | SyncError::Storage(_) => ErrorKind::Internal,
        }
    }

    pub fn aborts_pass(&self) -> bool {
        self.kind().aborts_pass()
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Connectivity { message } => SyncError::Connectivity(message),
            RemoteError::Authentication { message } => SyncError::Authentication(message),
            RemoteError::NotFound { entity } => SyncError::ObjectNotFound(entity),
            RemoteError::Format { message } => SyncError::Format(message),
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StorageFull => SyncError::StorageFull,
            other => SyncError::Storage(other),
        }
    }
}
