//! Single-flight coordination for OAuth refreshes.
//!
//! At most one refresh may be in flight per credential id; late arrivals
//! wait on the winner's lock and then re-read the persisted result.

use std::sync::Arc;

use {dashmap::DashMap, tokio::sync::Mutex};

/// Keyed mutex map. Entries are created on demand; the map is bounded by the
/// number of distinct credentials seen by this process.
pub struct SingleFlight {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SingleFlight {
    #[must_use]
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the per-key lock, waiting if another flight is active.
    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn serializes_same_key() {
        let flight = Arc::new(SingleFlight::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = flight.acquire("cred-1").await;
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let flight = Arc::new(SingleFlight::new());
        let guard_a = flight.acquire("a").await;
        // Must not deadlock: a different key is an independent lock.
        let guard_b = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            flight.acquire("b"),
        )
        .await
        .unwrap();
        drop(guard_a);
        drop(guard_b);
    }
}
