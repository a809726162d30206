//! Periodic sync trigger.
//!
//! Fires a scheduled pass every `interval`. After a pass that could not reach
//! the remote, the next attempt comes sooner, on an exponential backoff that
//! starts at [`BASE_RETRY`] and never exceeds the regular interval.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::sync::{ErrorKind, SyncOrchestrator, Trigger};

pub const BASE_RETRY: Duration = Duration::from_secs(15);

/// Exponential retry delay with downward jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// `base * 2^attempt`, capped, minus up to 20% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = (delay.as_millis() / 5) as u64;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay - Duration::from_millis(jitter)
    }
}

/// Run the sync loop until `cancel` fires. The first pass starts right away.
///
/// A failed pass never stops the loop; the orchestrator records its outcome
/// and this only decides when to try again.
pub async fn run_sync_schedule(
    orchestrator: Arc<SyncOrchestrator>,
    interval_seconds: u64,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(interval_seconds);
    let mut backoff = Backoff::new(BASE_RETRY, interval);
    let mut delay = Duration::ZERO;

    tracing::info!("Sync scheduler started (interval: {}s)", interval_seconds);

    loop {
        tokio::select! {
            _ = time::sleep(delay) => {
                delay = poll_once(&orchestrator, &mut backoff, interval, &cancel).await;
            }

            _ = cancel.cancelled() => {
                tracing::info!("Shutdown requested. Stopping sync scheduler.");
                break;
            }
        }
    }

    tracing::info!("Sync scheduler stopped cleanly");
}

/// Execute a single scheduled pass and return the delay until the next one.
/// Extracted for testability.
pub async fn poll_once(
    orchestrator: &Arc<SyncOrchestrator>,
    backoff: &mut Backoff,
    interval: Duration,
    cancel: &CancellationToken,
) -> Duration {
    match orchestrator
        .run_on_pool(Trigger::Scheduled, cancel.clone())
        .await
    {
        Some(report) if report.last_error() == Some(ErrorKind::Connectivity) => {
            let retry = backoff.next_delay();
            tracing::warn!(
                "Remote unreachable (attempt {}), retrying in {:?}",
                backoff.attempt(),
                retry
            );
            retry
        }
        Some(_) => {
            backoff.reset();
            interval
        }
        None => interval,
    }
}
