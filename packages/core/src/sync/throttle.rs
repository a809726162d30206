//! Persisted "at most once per interval" gate for slow-moving sub-syncs.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::repository::{from_millis, to_millis, Repository, StoreResult};

#[derive(Debug, Clone)]
pub struct Throttle {
    key: &'static str,
    min_interval: Duration,
}

impl Throttle {
    pub fn new(key: &'static str, min_interval: Duration) -> Self {
        Self { key, min_interval }
    }

    pub fn daily(key: &'static str) -> Self {
        Self::new(key, Duration::hours(24))
    }

    pub async fn last_ran(&self, repo: &Repository) -> StoreResult<Option<DateTime<Utc>>> {
        let raw = repo.get_meta(self.key).await?;
        Ok(raw.and_then(|value| match value.parse::<i64>() {
            Ok(ms) => Some(from_millis(ms)),
            Err(_) => {
                warn!("Ignoring unreadable {} value {:?}", self.key, value);
                None
            }
        }))
    }

    /// Never ran, or ran at least `min_interval` before `now`. A stored time
    /// in the future (clock moved back) also counts as due.
    pub async fn is_due(&self, repo: &Repository, now: DateTime<Utc>) -> StoreResult<bool> {
        Ok(match self.last_ran(repo).await? {
            None => true,
            Some(last) => last > now || now - last >= self.min_interval,
        })
    }

    pub async fn mark_ran(&self, repo: &Repository, now: DateTime<Utc>) -> StoreResult<()> {
        repo.set_meta(self.key, &to_millis(now).to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{base_time, make_repo};

    #[tokio::test]
    async fn due_until_marked_then_waits_a_day() {
        let repo = make_repo().await;
        let throttle = Throttle::daily("maintenance_last_ran");
        let now = base_time();

        assert!(throttle.is_due(&repo, now).await.unwrap());
        throttle.mark_ran(&repo, now).await.unwrap();

        assert!(!throttle.is_due(&repo, now + Duration::hours(23)).await.unwrap());
        assert!(throttle.is_due(&repo, now + Duration::hours(24)).await.unwrap());
        assert_eq!(throttle.last_ran(&repo).await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn garbage_value_is_treated_as_never_ran() {
        let repo = make_repo().await;
        repo.set_meta("maintenance_last_ran", "yesterday").await.unwrap();

        let throttle = Throttle::daily("maintenance_last_ran");
        assert!(throttle.is_due(&repo, base_time()).await.unwrap());
    }

    #[tokio::test]
    async fn clock_moving_backwards_reopens_the_gate() {
        let repo = make_repo().await;
        let throttle = Throttle::daily("maintenance_last_ran");
        throttle.mark_ran(&repo, base_time()).await.unwrap();

        assert!(throttle
            .is_due(&repo, base_time() - Duration::hours(1))
            .await
            .unwrap());
    }
}
