use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{info, warn};

use crate::store::MemoryStore;

/// Background task that compacts the WAL once `threshold` records have been
/// appended since the last compaction. Exits when the store is dropped.
pub async fn run_compactor(store: Weak<MemoryStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let Some(store) = store.upgrade() else {
            return;
        };
        compact_if_needed(&store, threshold).await;
    }
}

/// One compactor pass. Returns true if the WAL was rewritten.
pub async fn compact_if_needed(store: &Arc<MemoryStore>, threshold: u64) -> bool {
    if threshold == 0 || !store.is_durable() {
        return false;
    }
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let staff_id = Ulid::new();

        for _ in 0..3 {
            store.set_working_hours(staff_id, None).await.unwrap();
        }
        assert!(!compact_if_needed(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 3);

        for _ in 0..2 {
            store.set_working_hours(staff_id, None).await.unwrap();
        }
        assert!(compact_if_needed(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn volatile_store_is_never_compacted() {
        let store = Arc::new(MemoryStore::new());
        assert!(!compact_if_needed(&store, 1).await);
    }

    #[tokio::test]
    async fn compactor_exits_when_store_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let task = tokio::spawn(run_compactor(
            Arc::downgrade(&store),
            10,
            Duration::from_millis(5),
        ));
        drop(store);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("compactor should stop")
            .unwrap();
    }
}
