//! Configuration for the aggregation engine

use std::time::Duration;

use super::rank::Thresholds;

#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Rows a metric must accumulate before its scores leave probation.
    pub learning_threshold: i64,
    pub thresholds: Thresholds,
    pub memo_ttl: Duration,
    /// Largest `bucket_count` a single request may ask for.
    pub max_bucket_count: usize,
    /// Skip buckets that fall entirely inside a closed calendar interval.
    pub skip_closed_buckets: bool,
    /// How many candidate buckets may be examined per requested bucket when
    /// skipping closed ones.
    pub gap_search_factor: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            learning_threshold: 1000,
            thresholds: Thresholds::default(),
            memo_ttl: Duration::from_secs(300),
            max_bucket_count: 2_000,
            skip_closed_buckets: true,
            gap_search_factor: 4,
        }
    }
}
