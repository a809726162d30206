//! Background population of the hot cache from the local store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HotCache;
use crate::repository::{Repository, StoreResult};

/// Scan the store backward in one-day windows from `now` to `horizon`,
/// loading every row into `cache`, then mark the cache warm.
///
/// Returns the number of rows loaded. Newest data is loaded first so the
/// most-viewed range becomes available soonest. Stops early without marking
/// the cache warm if `cancel` fires.
///
/// Warm-up runs alongside sync passes. A window read before a concurrent
/// eviction is discarded and read again, so rows removed from the store are
/// never put back into the cache.
pub async fn warm_up(
    cache: &HotCache,
    repo: &Repository,
    horizon: DateTime<Utc>,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> StoreResult<usize> {
    let window = Duration::days(1);
    let mut window_end = now + window;
    let mut loaded = 0;

    while window_end > horizon {
        if cancel.is_cancelled() {
            debug!("Cache warm-up cancelled after {} rows", loaded);
            return Ok(loaded);
        }

        let window_start = (window_end - window).max(horizon);
        loaded += load_window(cache, repo, window_start, window_end).await?;
        window_end = window_start;
    }

    cache.mark_warm(horizon);
    Ok(loaded)
}

/// Load one window, re-reading it until no eviction interleaves the read and
/// the insert.
async fn load_window(
    cache: &HotCache,
    repo: &Repository,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> StoreResult<usize> {
    loop {
        let generation = cache.eviction_generation();
        let points = repo.fetch_points_between(start, end).await?;
        if cache.upsert_batch_since(&points, generation).is_some() {
            return Ok(points.len());
        }
        debug!("Eviction during warm-up of {}..{}, reloading", start, end);
    }
}

/// Run [`warm_up`] on its own task. Errors are logged and end the warm-up;
/// the cache then stays cold and readers fall back to the store.
pub fn spawn_warm_up(
    cache: Arc<HotCache>,
    repo: Repository,
    horizon: DateTime<Utc>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match warm_up(&cache, &repo, horizon, Utc::now(), &cancel).await {
            Ok(rows) if cache.is_warm() => info!("Hot cache warmed with {} rows", rows),
            Ok(_) => {}
            Err(err) => warn!("Hot cache warm-up stopped: {}", err),
        }
    })
}
