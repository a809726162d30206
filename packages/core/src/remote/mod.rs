//! Remote Data Source Interface
//!
//! Abstraction over the analytics backend the local store is synchronized
//! with. [`HttpRemoteSource`] talks to the real service; [`MockRemote`] is an
//! in-memory stand-in for tests and offline runs.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Annotation, AppMetadata, DataPoint, Metric, Notification};

pub use http::HttpRemoteSource;
pub use mock::MockRemote;

/// Errors from remote data sources
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Connectivity error: {message}")]
    Connectivity { message: String },

    #[error("Authentication error: {message}")]
    Authentication { message: String },

    #[error("Object not found: {entity}")]
    NotFound { entity: String },

    #[error("Data format error: {message}")]
    Format { message: String },
}

impl RemoteError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity { message: message.into() }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication { message: message.into() }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound { entity: entity.into() }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format { message: message.into() }
    }
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Receiver for pages of raw rows streamed out of [`RemoteDataSource::fetch_raw_data`].
#[async_trait]
pub trait RawDataSink: Send + Sync {
    /// Hand over one page. Returning `false` asks the source to stop paging.
    async fn accept(&self, batch: Vec<DataPoint>) -> bool;
}

/// Trait for remote sources to keep the sync pipeline transport-independent
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    /// Full snapshot of every metric the user can see.
    async fn fetch_metrics(&self) -> RemoteResult<Vec<Metric>>;

    /// Annotations with `from <= timestamp <= to`.
    async fn fetch_annotations(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> RemoteResult<Vec<Annotation>>;

    /// Stream raw rows of one metric with `from <= timestamp <= to` into
    /// `sink`, page by page. Returns the number of rows delivered.
    async fn fetch_raw_data(
        &self,
        metric_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        sink: &dyn RawDataSink,
    ) -> RemoteResult<usize>;

    /// Full snapshot of unacknowledged notifications.
    async fn fetch_notifications(&self) -> RemoteResult<Vec<Notification>>;

    async fn acknowledge_notifications(&self, ids: &[String]) -> RemoteResult<()>;

    async fn fetch_app_metadata(&self) -> RemoteResult<AppMetadata>;

    /// Get the name of this source for logging
    fn source_name(&self) -> &str;
}
