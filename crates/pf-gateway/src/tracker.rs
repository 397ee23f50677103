//! Fire-and-forget usage telemetry.
//!
//! Two independent, separately throttled writes per authenticated caller:
//! a per-user last-seen timestamp (at most once per interval) and an
//! hourly activity bucket (at most one write per user per hour from this
//! process; the store-side write is an atomic upsert so concurrent
//! processes merge instead of clobbering). Both are advisory and lossy
//! under races. Failures are logged at warn and never reach the caller;
//! the orchestrator runs the tracker detached from the response path.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, Timelike, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// In-process throttle entries older than this are pruned on every write.
const CACHE_RETENTION: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("activity write failed: {0}")]
    Write(String),
}

/// Persistence seam for activity records. The gateway only knows this
/// trait; the binary provides the concrete store.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Update the user's last-seen timestamp. Must be conditioned on the
    /// profile already existing so deleted accounts are not resurrected;
    /// a skip for that reason is a success, not an error.
    async fn touch_last_seen(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Atomic upsert of the hourly bucket: set first-seen only if absent,
    /// always overwrite last-seen, increment-or-initialize the counter.
    async fn bump_hourly_bucket(
        &self,
        user_id: &str,
        date: &str,
        hour: u32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Store that drops everything, used when telemetry is disabled.
pub struct NoopActivityStore;

#[async_trait]
impl ActivityStore for NoopActivityStore {
    async fn touch_last_seen(&self, _user_id: &str, _at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn bump_hourly_bucket(
        &self,
        _user_id: &str,
        _date: &str,
        _hour: u32,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub enabled: bool,
    /// Minimum gap between two last-seen writes for one user.
    pub last_seen_interval: Duration,
    /// Bucket dates and hours are computed in this fixed timezone.
    pub timezone: FixedOffset,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            last_seen_interval: Duration::from_secs(300),
            // US Eastern standard time, the platform's reporting timezone
            timezone: FixedOffset::west_opt(5 * 3600).expect("static offset in range"),
        }
    }
}

/// Dual-throttled activity recorder. Cheap to share; one instance lives
/// for the whole process so the throttle caches survive across requests.
pub struct ActivityTracker {
    store: Arc<dyn ActivityStore>,
    settings: TrackerSettings,
    last_seen: DashMap<String, DateTime<Utc>>,
    hourly: DashMap<String, DateTime<Utc>>,
}

impl ActivityTracker {
    pub fn new(store: Arc<dyn ActivityStore>, settings: TrackerSettings) -> Self {
        Self {
            store,
            settings,
            last_seen: DashMap::new(),
            hourly: DashMap::new(),
        }
    }

    /// Record one authenticated request for a user. Never returns an
    /// error; every failure is logged and swallowed.
    pub async fn record(&self, user_id: &str) {
        self.record_at(user_id, Utc::now()).await;
    }

    pub async fn record_at(&self, user_id: &str, now: DateTime<Utc>) {
        if !self.settings.enabled {
            return;
        }
        self.prune(now);

        if self.should_touch_last_seen(user_id, now) {
            self.last_seen.insert(user_id.to_string(), now);
            if let Err(e) = self.store.touch_last_seen(user_id, now).await {
                warn!(user_id = %user_id, error = %e, "Last-seen write failed");
            }
        }

        let local = now.with_timezone(&self.settings.timezone);
        let date = format!(
            "{:04}-{:02}-{:02}",
            local.year(),
            local.month(),
            local.day()
        );
        let hour = local.hour();
        let bucket_key = format!("{user_id}#{date}#{hour:02}");
        if !self.hourly.contains_key(&bucket_key) {
            self.hourly.insert(bucket_key, now);
            debug!(user_id = %user_id, date = %date, hour = hour, "Opening hourly bucket");
            if let Err(e) = self.store.bump_hourly_bucket(user_id, &date, hour, now).await {
                warn!(user_id = %user_id, error = %e, "Hourly bucket write failed");
            }
        }
    }

    fn should_touch_last_seen(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        match self.last_seen.get(user_id) {
            Some(prev) => {
                let elapsed = now.signed_duration_since(*prev);
                elapsed.num_seconds() >= self.settings.last_seen_interval.as_secs() as i64
            }
            None => true,
        }
    }

    /// Drop throttle entries older than the retention window so the maps
    /// stay bounded in a long-lived process.
    fn prune(&self, now: DateTime<Utc>) {
        let horizon = now - chrono::Duration::seconds(CACHE_RETENTION.as_secs() as i64);
        self.last_seen.retain(|_, at| *at > horizon);
        self.hourly.retain(|_, at| *at > horizon);
    }

    /// Clear both throttle caches.
    pub fn reset(&self) {
        self.last_seen.clear();
        self.hourly.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingStore {
        touches: Mutex<Vec<(String, DateTime<Utc>)>>,
        bumps: Mutex<Vec<(String, String, u32)>>,
        fail: bool,
    }

    #[async_trait]
    impl ActivityStore for RecordingStore {
        async fn touch_last_seen(
            &self,
            user_id: &str,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Write("boom".to_string()));
            }
            self.touches.lock().push((user_id.to_string(), at));
            Ok(())
        }

        async fn bump_hourly_bucket(
            &self,
            user_id: &str,
            date: &str,
            hour: u32,
            _at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Write("boom".to_string()));
            }
            self.bumps
                .lock()
                .push((user_id.to_string(), date.to_string(), hour));
            Ok(())
        }
    }

    fn tracker(store: Arc<RecordingStore>) -> ActivityTracker {
        ActivityTracker::new(
            store,
            TrackerSettings {
                enabled: true,
                last_seen_interval: Duration::from_secs(300),
                timezone: FixedOffset::west_opt(5 * 3600).unwrap(),
            },
        )
    }

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, min, 0).unwrap()
    }

    #[tokio::test]
    async fn last_seen_is_throttled_to_the_interval() {
        let store = Arc::new(RecordingStore::default());
        let t = tracker(store.clone());

        t.record_at("u1", at(12, 0)).await;
        t.record_at("u1", at(12, 1)).await;
        assert_eq!(store.touches.lock().len(), 1);

        t.record_at("u1", at(12, 6)).await;
        assert_eq!(store.touches.lock().len(), 2);
    }

    #[tokio::test]
    async fn last_seen_throttle_is_per_user() {
        let store = Arc::new(RecordingStore::default());
        let t = tracker(store.clone());

        t.record_at("u1", at(12, 0)).await;
        t.record_at("u2", at(12, 0)).await;
        assert_eq!(store.touches.lock().len(), 2);
    }

    #[tokio::test]
    async fn hourly_bucket_written_once_per_hour() {
        let store = Arc::new(RecordingStore::default());
        let t = tracker(store.clone());

        t.record_at("u1", at(12, 0)).await;
        t.record_at("u1", at(12, 59)).await;
        assert_eq!(store.bumps.lock().len(), 1);

        t.record_at("u1", at(13, 0)).await;
        assert_eq!(store.bumps.lock().len(), 2);
    }

    #[tokio::test]
    async fn bucket_date_and_hour_use_target_timezone() {
        let store = Arc::new(RecordingStore::default());
        let t = tracker(store.clone());

        // 02:30 UTC on the 15th is 21:30 on the 14th at UTC-5
        t.record_at("u1", at(2, 30)).await;
        let bumps = store.bumps.lock();
        assert_eq!(bumps.len(), 1);
        assert_eq!(bumps[0].1, "2025-06-14");
        assert_eq!(bumps[0].2, 21);
    }

    #[tokio::test]
    async fn caches_are_pruned_after_retention_window() {
        let store = Arc::new(RecordingStore::default());
        let t = tracker(store.clone());

        t.record_at("u1", at(12, 0)).await;
        assert_eq!(t.last_seen.len(), 1);

        let next_day = at(12, 0) + chrono::Duration::hours(25);
        t.record_at("u2", next_day).await;
        // u1's entries from 25 hours ago are gone
        assert!(t.last_seen.get("u1").is_none());
        assert_eq!(t.last_seen.len(), 1);
        assert_eq!(t.hourly.len(), 1);
    }

    #[tokio::test]
    async fn store_failures_are_swallowed() {
        let store = Arc::new(RecordingStore {
            fail: true,
            ..Default::default()
        });
        let t = tracker(store.clone());

        // must not panic or propagate
        t.record_at("u1", at(12, 0)).await;
        assert_eq!(store.touches.lock().len(), 0);
    }

    #[tokio::test]
    async fn disabled_tracker_writes_nothing() {
        let store = Arc::new(RecordingStore::default());
        let t = ActivityTracker::new(
            store.clone(),
            TrackerSettings {
                enabled: false,
                ..Default::default()
            },
        );
        t.record_at("u1", at(12, 0)).await;
        assert!(store.touches.lock().is_empty());
        assert!(store.bumps.lock().is_empty());
    }

    #[tokio::test]
    async fn reset_clears_both_throttles() {
        let store = Arc::new(RecordingStore::default());
        let t = tracker(store.clone());

        t.record_at("u1", at(12, 0)).await;
        t.reset();
        t.record_at("u1", at(12, 1)).await;
        assert_eq!(store.touches.lock().len(), 2);
        assert_eq!(store.bumps.lock().len(), 2);
    }

    /// Upsert semantics expected of a real store: two bumps for the same
    /// bucket merge into one record with count 2, first-seen unchanged,
    /// last-seen moved forward.
    #[derive(Default)]
    struct UpsertStore {
        buckets: Mutex<HashMap<String, (DateTime<Utc>, DateTime<Utc>, u64)>>,
    }

    #[async_trait]
    impl ActivityStore for UpsertStore {
        async fn touch_last_seen(
            &self,
            _user_id: &str,
            _at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn bump_hourly_bucket(
            &self,
            user_id: &str,
            date: &str,
            hour: u32,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let key = format!("{date}#{hour:02}#{user_id}");
            let mut buckets = self.buckets.lock();
            buckets
                .entry(key)
                .and_modify(|(_, last, count)| {
                    *last = at;
                    *count += 1;
                })
                .or_insert((at, at, 1));
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_processes_merge_into_one_bucket() {
        let store = UpsertStore::default();
        let first = at(12, 0);
        let second = at(12, 30);
        store.bump_hourly_bucket("u1", "2025-06-15", 7, first).await.unwrap();
        store.bump_hourly_bucket("u1", "2025-06-15", 7, second).await.unwrap();

        let buckets = store.buckets.lock();
        let (first_seen, last_seen, count) = buckets.get("2025-06-15#07#u1").unwrap();
        assert_eq!(*count, 2);
        assert_eq!(*first_seen, first);
        assert_eq!(*last_seen, second);
    }
}
