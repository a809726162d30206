//! Process-wide synchronization status.
//!
//! Readers load an immutable [`SyncStatus`] snapshot without locking; the
//! orchestrator swaps in a new snapshot while it holds the sync lock.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::ErrorKind;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
    pub in_progress: bool,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Last time every remote call of a pass succeeded in reaching the server.
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorKind>,
    /// Set after the server rejected our credentials; scheduled passes are
    /// skipped until an explicit refresh.
    pub auth_required: bool,
}

impl SyncStatus {
    /// Human-readable status line for the current error, if any.
    ///
    /// Built only from the error class and the time since the last
    /// successful contact; never from raw error text.
    pub fn user_message(&self, now: DateTime<Utc>) -> Option<String> {
        if self.auth_required {
            return Some("Please sign in again to resume syncing.".to_string());
        }

        match self.last_error? {
            ErrorKind::Connectivity => Some(format!(
                "Unable to reach the server. {}",
                self.staleness(now)
            )),
            ErrorKind::Authentication => {
                Some("Please sign in again to resume syncing.".to_string())
            }
            ErrorKind::StorageFull => Some(
                "Device storage is full. Older data was removed to make room.".to_string(),
            ),
            ErrorKind::Internal => Some(format!("Sync did not complete. {}", self.staleness(now))),
            ErrorKind::ObjectNotFound | ErrorKind::Cancelled => None,
        }
    }

    fn staleness(&self, now: DateTime<Utc>) -> String {
        match self.last_connected_at {
            None => "Data has not been updated yet.".to_string(),
            Some(at) => match (now - at).num_hours() {
                h if h < 1 => "Data was updated less than an hour ago.".to_string(),
                1 => "Data was last updated 1 hour ago.".to_string(),
                h => format!("Data was last updated {} hours ago.", h),
            },
        }
    }
}

pub struct SyncState {
    current: ArcSwap<SyncStatus>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(SyncStatus::default()),
        }
    }
}

impl SyncState {
    pub fn snapshot(&self) -> Arc<SyncStatus> {
        self.current.load_full()
    }

    /// Copy, modify and publish. Callers must hold the sync lock.
    pub(crate) fn update(&self, f: impl FnOnce(&mut SyncStatus)) -> Arc<SyncStatus> {
        let mut next = SyncStatus::clone(&self.current.load());
        f(&mut next);
        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        next
    }
}
