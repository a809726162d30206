//! Aggregation Module
//!
//! Buckets raw anomaly scores into Hour/Day/Week windows, applies the
//! probation policy, ranks entities by severity and memoizes results.

pub mod bucket;
pub mod config;
pub mod engine;
pub mod error;
pub mod rank;


pub use bucket::{BucketSize, BucketWindow};
pub use config::AggregationConfig;
pub use engine::{AggregationEngine, Bucket, EntityRef, RankedInstance};
pub use error::AggregationError;
pub use rank::{rank, EntityRank, Severity, Thresholds};
